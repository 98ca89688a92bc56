//! A connected robot.
//!
//! # Design
//!
//! ```text
//!  Caller (native / blocking / deferred)
//!       │  Robot::connect() / component calls -> Call<T>
//!       ▼
//!  ModeAdapter ── ExecutionContext ("cozmars-worker")
//!                     ├── Transport (unary calls, streams)
//!                     ├── sensor event loop ── TouchSensor / Sonar / Infrared
//!                     │                          └── CallbackRunner
//!                     └── StreamMultiplexers (camera, microphone, sensor_data)
//! ```
//!
//! [`Robot::connect`] is the blocking entry point, [`Robot::connect_async`]
//! the native one; both end up with the same worker-owned state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::components::{
    Camera, Env, Head, Infrared, Microphone, Motors, Remote, Sonar, Speaker, TouchSensor,
};
use crate::config::RobotConfig;
use crate::context::ExecutionContext;
use crate::error::{Error, Result};
use crate::event::{CallbackRunner, SensorData, SensorEvent};
use crate::mode::{Mode, ModeAdapter};
use crate::multiplexer::StreamMultiplexer;
use crate::subscriber::{BufferOptions, OverflowPolicy, Subscriber};
use crate::transport::{Connector, Transport};

/// Sensor events buffered ahead of the event loop.
const EVENT_QUEUE: usize = 64;

/// Sensors that react to pushed events.
#[derive(Clone)]
struct EventRouter {
    touch: Arc<TouchSensor>,
    sonar: Arc<Sonar>,
    infrared: Arc<Infrared>,
    runner: CallbackRunner,
}

impl EventRouter {
    async fn route(&self, event: &SensorEvent) {
        trace!("Sensor event {} {}", event.name, event.data);
        if self.touch.handle(&self.runner, event).await
            || self.sonar.handle(&self.runner, event).await
            || self.infrared.handle(&self.runner, event).await
        {
            return;
        }
        debug!("Ignoring unknown sensor event {}", event.name);
    }

    async fn run(self, events: Subscriber<SensorEvent>, cancel: CancellationToken) {
        debug!("Sensor event loop started");
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = events.recv() => next,
            };
            match next {
                Ok(Some(event)) => self.route(&event).await,
                Ok(None) => {
                    debug!("Sensor event stream ended");
                    break;
                }
                Err(Error::StreamClosed) => break,
                Err(e) => {
                    warn!("Sensor event stream failed: {}", e);
                    break;
                }
            }
        }
        if let Err(e) = events.close_async().await {
            debug!("Detaching sensor event loop: {}", e);
        }
        debug!("Sensor event loop stopped");
    }
}

/// A connected Cozmars robot.
pub struct Robot {
    config: RobotConfig,
    adapter: ModeAdapter,
    connected: AtomicBool,
    event_cancel: CancellationToken,
    events: StreamMultiplexer<SensorData>,
    router: EventRouter,
    camera: Camera,
    microphone: Microphone,
    speaker: Speaker,
    head: Head,
    motors: Motors,
    env: Env,
}

impl Robot {
    // ── connection ───────────────────────────────────────────────────────

    /// Connect and start the sensor event loop, blocking the caller.
    ///
    /// Must not be called from async code; use
    /// [`connect_async`](Self::connect_async) there.
    pub fn connect<C: Connector>(config: RobotConfig, connector: C) -> Result<Self> {
        config.validate()?;
        let context = ExecutionContext::with_shutdown_timeout(config.shutdown_timeout())?;
        let host = config.host.clone();
        let transport = context
            .submit(async move { connector.connect(&host).await })
            .wait(None)
            .and_then(|t| t.ok_or(Error::Timeout));
        let transport = match transport {
            Ok(t) => t,
            Err(e) => {
                context.shutdown();
                return Err(e);
            }
        };

        let robot = Self::assemble(config, context, transport);
        let events = robot
            .events
            .subscribe(event_buffer())
            .wait()
            .inspect_err(|_| robot.context().shutdown())?;
        robot.start(events);
        Ok(robot)
    }

    /// Connect and start the sensor event loop from async code.
    pub async fn connect_async<C: Connector>(config: RobotConfig, connector: C) -> Result<Self> {
        config.validate()?;
        let context = ExecutionContext::with_shutdown_timeout(config.shutdown_timeout())?;
        let host = config.host.clone();
        let transport = match context.submit(async move { connector.connect(&host).await }).await {
            Ok(t) => t,
            Err(e) => {
                context.shutdown();
                return Err(e);
            }
        };

        let robot = Self::assemble(config, context, transport);
        let events = match robot.events.subscribe(event_buffer()).await {
            Ok(events) => events,
            Err(e) => {
                robot.context().shutdown();
                return Err(e);
            }
        };
        robot.start(events);
        Ok(robot)
    }

    fn assemble(config: RobotConfig, context: ExecutionContext, transport: Arc<dyn Transport>) -> Self {
        let adapter = ModeAdapter::new(config.mode, context.clone())
            .with_default_timeout(config.call_timeout());
        let remote = Remote::new(adapter.clone(), transport.clone());
        info!("Connected to {} in {} mode", config.host, config.mode);

        Self {
            events: StreamMultiplexer::new(SensorData, transport, adapter.clone()),
            router: EventRouter {
                touch: Arc::new(TouchSensor::new(remote.clone())),
                sonar: Arc::new(Sonar::new(remote.clone())),
                infrared: Arc::new(Infrared::new()),
                runner: CallbackRunner::new(config.mode, context),
            },
            camera: Camera::new(remote.clone(), &config.camera),
            microphone: Microphone::new(remote.clone(), &config.microphone),
            speaker: Speaker::new(remote.clone(), &config.speaker),
            head: Head::new(remote.clone()),
            motors: Motors::new(remote.clone()),
            env: Env::new(remote),
            connected: AtomicBool::new(true),
            event_cancel: CancellationToken::new(),
            adapter,
            config,
        }
    }

    fn start(&self, events: Subscriber<SensorEvent>) {
        let router = self.router.clone();
        let cancel = self.event_cancel.clone();
        self.context().spawn(router.run(events, cancel));
    }

    /// Stop the event loop, close every stream and stop the worker.
    ///
    /// Idempotent. Errors from closing individual streams are returned after
    /// the worker has been stopped.
    ///
    /// Parks the calling thread while streams close; from async code use
    /// [`disconnect_async`](Self::disconnect_async).
    pub fn disconnect(&self) -> Result<()> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.event_cancel.cancel();
        let outcome = self.adapter.property(self.close_streams());
        self.context().shutdown();
        info!("Disconnected from {}", self.config.host);
        settle(outcome)
    }

    /// Async counterpart of [`disconnect`](Self::disconnect).
    pub async fn disconnect_async(&self) -> Result<()> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.event_cancel.cancel();
        let outcome = self.adapter.call_async(self.close_streams()).await;
        self.context().shutdown();
        info!("Disconnected from {}", self.config.host);
        settle(outcome)
    }

    fn close_streams(&self) -> impl std::future::Future<Output = Result<()>> + Send + 'static {
        let events = self.events.clone();
        let camera = self.camera.multiplexer().clone();
        let microphone = self.microphone.multiplexer().clone();
        let speaker = self.speaker.input();
        async move {
            let mut first_error = None;
            let outcomes = [
                events.shutdown().await,
                camera.shutdown().await,
                microphone.shutdown().await,
                speaker.close().await,
            ];
            for outcome in outcomes {
                if let Err(e) = outcome {
                    warn!("Closing stream on disconnect: {}", e);
                    first_error.get_or_insert(e);
                }
            }
            first_error.map_or(Ok(()), Err)
        }
    }

    // ── state ────────────────────────────────────────────────────────────

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.context().is_alive()
    }

    pub fn host(&self) -> &str {
        &self.config.host
    }

    pub fn mode(&self) -> Mode {
        self.adapter.mode()
    }

    pub fn config(&self) -> &RobotConfig {
        &self.config
    }

    pub fn adapter(&self) -> &ModeAdapter {
        &self.adapter
    }

    pub fn context(&self) -> &ExecutionContext {
        self.adapter.context()
    }

    // ── components ───────────────────────────────────────────────────────

    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    pub fn microphone(&self) -> &Microphone {
        &self.microphone
    }

    pub fn speaker(&self) -> &Speaker {
        &self.speaker
    }

    pub fn head(&self) -> &Head {
        &self.head
    }

    pub fn motors(&self) -> &Motors {
        &self.motors
    }

    pub fn env(&self) -> &Env {
        &self.env
    }

    pub fn touch_sensor(&self) -> &TouchSensor {
        &self.router.touch
    }

    pub fn sonar(&self) -> &Sonar {
        &self.router.sonar
    }

    pub fn infrared(&self) -> &Arc<Infrared> {
        &self.router.infrared
    }

    /// Raw sensor events, for consumers that want more than callbacks.
    pub fn sensor_events(&self) -> &StreamMultiplexer<SensorData> {
        &self.events
    }
}

fn event_buffer() -> BufferOptions {
    BufferOptions::new(EVENT_QUEUE).with_policy(OverflowPolicy::DropOldest)
}

/// A worker that is already gone has nothing left to close.
fn settle(outcome: Result<()>) -> Result<()> {
    match outcome {
        Err(Error::ContextClosed) => Ok(()),
        other => other,
    }
}

impl Drop for Robot {
    fn drop(&mut self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            debug!("Robot dropped while connected, stopping worker");
            self.event_cancel.cancel();
            self.context().shutdown();
        }
    }
}

impl std::fmt::Debug for Robot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Robot")
            .field("host", &self.config.host)
            .field("mode", &self.mode())
            .field("connected", &self.is_connected())
            .finish()
    }
}
