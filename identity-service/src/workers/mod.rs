pub mod maintenance;

pub use maintenance::{MaintenanceReport, MaintenanceSettings, MaintenanceWorker};
