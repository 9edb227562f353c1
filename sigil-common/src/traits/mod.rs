pub mod fsm;
pub mod handler;

pub use self::{
    fsm::FiniteStateMachine,
    handler::{MessageHandler, SubmissionResult},
};
