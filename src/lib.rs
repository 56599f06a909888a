//! KHID - Kawasaki AS monitor terminal driver
//!
//! Talks to Kawasaki robot controllers (and the K-ROSET simulator) over the
//! AS terminal protocol: login, status queries, program upload, and control
//! of the robot control program (RCP) and the five PC threads.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use khid::{Config, ProgramText, RobotController};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load_from_path("config/default_config.yaml")?;
//!     let robot = RobotController::connect(config).await?;
//!
//!     let program = ProgramText::new("blink", "SIGNAL 1\nTWAIT 0.5\nSIGNAL -1")?;
//!     robot.upload_program(&program).await?.into_result(program.name())?;
//!     robot.pc_execute("blink", 1).await?;
//!
//!     let threads = robot.pc_status(khid::ThreadMask::ALL).await?;
//!     println!("{:?}", threads[0]);
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - **Transport**: raw byte stream with receive-until-marker reads
//! - **Session**: one logged-in terminal, strictly one command in flight
//! - **RobotController**: shared session with busy gating and deadlines
//! - **StatusPoller**: background status snapshots on a dedicated session

pub mod config;
pub mod controller;
pub mod error;
pub mod execution;
pub mod json_output;
pub mod monitoring;
pub mod protocol;
pub mod session;
pub mod status;
pub mod transport;
pub mod upload;

pub use config::{Config, ConnectionConfig, PollingConfig, RobotConfig, UploadConfig};
pub use controller::{connect_session, RobotController};
pub use error::{KHIError, Result};
pub use execution::RcpOutcome;
pub use json_output::{CommandStatus, CommandStatusEvent, DataEvent, ErrorEvent, UploadEvent};
pub use monitoring::{SnapshotFilter, StatusPoller, StatusSnapshot};
pub use protocol::{pack_threads, Slot, ThreadMask};
pub use session::{Session, SessionOptions};
pub use status::{RcpState, RobotState, ThreadState};
pub use transport::{MarkerReader, TcpTransport, Transport};
pub use upload::{ProgramBuilder, ProgramText, SyntaxErrorRecord, SyntaxPolicy, UploadOutcome};
