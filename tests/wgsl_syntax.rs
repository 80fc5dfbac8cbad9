use affine_fusion::KernelRegistry;
use naga::front::wgsl::parse_str;

#[test]
fn all_registered_kernels_parse() {
    let registry = KernelRegistry::global();
    assert!(!registry.is_empty());
    for kernel in registry.handles() {
        let module = parse_str(&kernel.source)
            .unwrap_or_else(|err| panic!("{} failed: {err}", kernel.name));
        assert!(
            module.entry_points.iter().any(|e| e.name == "main"),
            "{} has no main entry point",
            kernel.name
        );
    }
}
