//! toolora - multi-tool file processing pipeline
//!
//! Accepts uploads for one of the registered tools, validates them against the
//! tool's descriptor, runs the matching category handler (in-process PDF,
//! image and text work, or `ffmpeg`/`qpdf` subprocesses) and stores the
//! results as short-lived downloadable artifacts.

pub mod artifact;
pub mod audio;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod gateway;
pub mod handler;
pub mod image;
pub mod intake;
pub mod metrics;
pub mod pdf;
pub mod pool;
pub mod registry;
pub mod request;
pub mod server;
pub mod store;
pub mod subprocess;
pub mod sweeper;
pub mod text;
pub mod utility;
pub mod validation;
pub mod video;

pub use config::Config;
pub use dispatcher::Dispatcher;
pub use error::{PipelineError, Result};
pub use registry::{ToolCategory, ToolDescriptor, ToolRegistry};
pub use request::{ProcessingRequest, ProcessingResult};
pub use server::{router, AppState};
