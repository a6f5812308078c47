pub mod queries;
pub mod supervisor;

pub use queries::ColorQueryState;
pub use supervisor::{PtyEvent, PtyShared, PtySupervisor};
