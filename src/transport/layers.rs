mod payload;
pub use payload::{PayloadLayer, PayloadService};
