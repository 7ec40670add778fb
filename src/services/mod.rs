pub mod asset_service;
pub mod asset_store;
pub mod derivation_service;
pub mod person_service;
pub mod pipeline;
pub mod reconcile_service;
pub mod training_service;

pub use asset_service::*;
pub use asset_store::*;
pub use derivation_service::*;
pub use person_service::*;
pub use pipeline::*;
pub use reconcile_service::*;
pub use training_service::*;
