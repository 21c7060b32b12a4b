pub mod context;
pub mod decision;
pub mod event;
pub mod redaction;
pub mod stats;
pub mod time;
pub mod worker;
