pub mod allocation;
pub mod anomaly;
pub mod arrival;
pub mod clock;
pub mod error;
pub mod expiry;
pub mod lifecycle;
pub mod memory;
pub mod models;
pub mod payment;
pub mod policy;
pub mod projection;
pub mod repository;
pub mod retry;
pub mod service;
pub mod voting;

pub use error::{CoreError, CoreResult};
pub use memory::InMemoryLedger;
pub use repository::Ledger;
pub use service::ReservationService;
