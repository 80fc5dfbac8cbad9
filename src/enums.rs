use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ResampleError;

/// Interpolation kernel used when sampling the source volume.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    Nearest,
    #[default]
    Linear,
    #[serde(rename = "cubspl")]
    CubicSpline,
}

impl Method {
    pub const ALL: [Method; 3] = [Method::Nearest, Method::Linear, Method::CubicSpline];

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Nearest => "nearest",
            Method::Linear => "linear",
            Method::CubicSpline => "cubspl",
        }
    }
}

impl FromStr for Method {
    type Err = ResampleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "nearest" => Ok(Method::Nearest),
            "linear" | "trilinear" => Ok(Method::Linear),
            "cubspl" | "cubic" => Ok(Method::CubicSpline),
            other => Err(ResampleError::unsupported(format!(
                "invalid interpolation method '{other}'"
            ))),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Element type of a volume buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementType {
    #[serde(rename = "uint16", alias = "u16")]
    U16,
    #[serde(rename = "float32", alias = "f32")]
    F32,
}

impl ElementType {
    pub const ALL: [ElementType; 2] = [ElementType::U16, ElementType::F32];

    pub fn as_str(&self) -> &'static str {
        match self {
            ElementType::U16 => "uint16",
            ElementType::F32 => "float32",
        }
    }

    /// Size of one sample on the host.
    pub fn size_of(&self) -> usize {
        match self {
            ElementType::U16 => std::mem::size_of::<u16>(),
            ElementType::F32 => std::mem::size_of::<f32>(),
        }
    }
}

impl FromStr for ElementType {
    type Err = ResampleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "uint16" | "u16" => Ok(ElementType::U16),
            "float32" | "f32" => Ok(ElementType::F32),
            other => Err(ResampleError::unsupported(format!(
                "invalid datatype '{other}'"
            ))),
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a freshly resampled view is combined with the running result.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlendMode {
    #[default]
    Max,
    Mean,
}

impl FromStr for BlendMode {
    type Err = ResampleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "max" => Ok(BlendMode::Max),
            "mean" => Ok(BlendMode::Mean),
            other => Err(ResampleError::unsupported(format!(
                "invalid blend mode '{other}'"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_names() {
        assert_eq!("cubspl".parse::<Method>().unwrap(), Method::CubicSpline);
        assert_eq!("NEAREST".parse::<Method>().unwrap(), Method::Nearest);
        assert_eq!("u16".parse::<ElementType>().unwrap(), ElementType::U16);
        assert_eq!("float32".parse::<ElementType>().unwrap(), ElementType::F32);
        assert_eq!("mean".parse::<BlendMode>().unwrap(), BlendMode::Mean);
    }

    #[test]
    fn rejects_unknown_names() {
        assert!(matches!(
            "lanczos".parse::<Method>(),
            Err(ResampleError::UnsupportedKernel(_))
        ));
        assert!(matches!(
            "int8".parse::<ElementType>(),
            Err(ResampleError::UnsupportedKernel(_))
        ));
    }
}
