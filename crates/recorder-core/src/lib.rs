pub mod actors;
mod events;
mod runtime;

pub use events::*;
pub use runtime::RecorderRuntime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    Inactive,
    Active,
    Finalizing,
}
