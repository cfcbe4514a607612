pub mod status;

pub use status::{StatusState, StatusStorage};
