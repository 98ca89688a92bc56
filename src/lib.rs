//! Execution and streaming core for the Cozmars robot remote-control client
//!
//! This crate owns everything between a caller's thread and the robot's RPC
//! transport. It allows applications to:
//!
//! - Drive the robot from plain threads, async code, or fire-and-forget
//!   callers, with one implementation of every operation ([`Mode`], [`Call`])
//! - Share one remote stream among many consumers ([`StreamMultiplexer`],
//!   [`Subscriber`]) without a slow consumer stalling the others
//! - React to pushed sensor events with sync or async callbacks
//!
//! # Architecture
//!
//! ```text
//! Application threads / async tasks
//!     ↓  Call<T>: .await | .invoke() | .wait()
//! ModeAdapter
//!     ↓  submit / run in place
//! ExecutionContext (single "cozmars-worker" thread)
//!     ↓
//! StreamEndpoint / StreamMultiplexer / sensor event loop
//!     ↓
//! Transport (external RPC stub)
//! ```
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use cozmars_stream::{MemoryTransport, Mode, Robot, RobotConfig};
//!
//! let sim = MemoryTransport::new();
//! let robot = Robot::connect(RobotConfig::new("sim").with_mode(Mode::Blocking), sim.clone())?;
//!
//! robot.head().set_angle_now(10.0).wait()?;
//! let frames = robot.camera().get_buffer(2).wait()?;
//! for frame in frames.iter().take(10) {
//!     println!("{} bytes", frame?.len());
//! }
//! robot.disconnect()?;
//! ```

pub mod components;
pub mod config;
pub mod context;
pub mod endpoint;
pub mod error;
pub mod event;
pub mod memory;
pub mod mode;
pub mod multiplexer;
pub mod robot;
pub mod subscriber;
pub mod transport;

// Re-export main types
pub use components::{
    AudioBlock, Camera, Env, Head, Infrared, Microphone, Motors, SensorArray, SensorChild, Sonar,
    Speaker, TouchSensor,
};
pub use config::RobotConfig;
pub use context::{ExecutionContext, OperationHandle};
pub use endpoint::{Dispatch, InputEndpoint, StreamEndpoint, StreamRequest, StreamSource};
pub use error::{Error, Result};
pub use event::{Callback, CallbackRunner, Callbacks, SensorData, SensorEvent, Trigger};
pub use memory::MemoryTransport;
pub use mode::{Call, CallOpts, Mode, ModeAdapter, Reply};
pub use multiplexer::StreamMultiplexer;
pub use robot::Robot;
pub use subscriber::{BufferOptions, OverflowPolicy, Subscriber, Terminal};
pub use transport::{ClientStream, ClientStreamReceiver, Connector, ServerStream, StreamFeed, Transport};
