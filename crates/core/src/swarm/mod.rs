//! # Swarm Orchestration
//!
//! The message bus, the typed messages that flow over it, the run
//! coordinator and the driver that wires everything together.
//!
//! ```text
//! ResearchPipeline ──▶ MessageBus ──▶ [Collector] [Summarizer] [Analyzer] [Grader]
//!                                     [Coordinator] [Writer] [Assembler]
//! ```

pub mod bus;
pub mod coordinator;
pub mod messages;
pub mod pipeline;

pub use bus::{Handler, HandlerContext, MessageBus, Publisher};
pub use coordinator::{CoordinatorStage, ReportSaved, RunPhase, RunState};
pub use messages::{Message, Topic, FAILURE_MARKER};
pub use pipeline::{Collaborators, ResearchPipeline, RunOutcome};
