use crate::id_table::SpatialDataHandle;

/// Errors from spatial system operations.
#[derive(Debug, thiserror::Error)]
pub enum SpatialError {
    #[error("invalid spatial data handle: {0:?}")]
    InvalidHandle(SpatialDataHandle),
    #[error("category {0} is outside the category bitmask")]
    InvalidCategory(u16),
    #[error("grid limit reached: requested {requested}, limit is {limit}")]
    GridExhaustion { requested: usize, limit: usize },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("frustum planes do not enclose a volume")]
    DegenerateFrustum,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}
