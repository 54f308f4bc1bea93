pub mod error;
pub mod middleware;
pub mod pagination;
pub mod response;

pub use error::{ApiError, Result};
pub use middleware::with_common_layers;
pub use pagination::{PageMeta, PageQuery, Paginated};
pub use response::ApiResponse;
