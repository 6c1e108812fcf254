use callplane::config::Config;
use callplane::domain::call::{
    Call, CallListener, CallState, CoreListener, EventLog, MediaParams, TransferTarget,
};
use callplane::domain::call_manager::CallManager;
use callplane::domain::shared::value_objects::SipUri;
use callplane::infrastructure::metrics;
use callplane::infrastructure::{
    run_host_loop, LocalBackgroundTasks, LocalHardware, LoopbackProbe, LoopbackSession,
    LoopbackSessionFactory,
};
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Logs every state change of the calls it watches
struct StateLogger;

impl CallListener for StateLogger {
    fn on_state_changed(&self, call: &Call, state: CallState, message: &str) {
        info!("[{}] {} ({})", call.remote_address(), state, message);
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // Load configuration, the first argument is an optional TOML file
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.as_str()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting callplane");
    info!("Configuration loaded: {:?}", config);

    if let Some(listen) = &config.metrics.prometheus_listen {
        metrics::install_exporter(listen)?;
        info!("Prometheus metrics exported on {}", listen);
    }

    let probe = LoopbackProbe::new();
    let identity = SipUri::parse("sip:demo@localhost")?;
    let manager = CallManager::new(
        config,
        identity,
        Box::new(LocalHardware::new()),
        Box::new(LocalBackgroundTasks::new()),
        Box::new(LoopbackSessionFactory::new(probe.clone())),
    );

    // Demo: run two calls through the state machine
    demo_call_lifecycle(&manager, &probe)?;

    info!("Running host loop, press Ctrl-C to stop");
    run_host_loop(&manager, Duration::from_millis(100), tokio::signal::ctrl_c()).await?;

    info!("Shutting down...");
    Ok(())
}

/// Demonstrate the call lifecycle
fn demo_call_lifecycle(manager: &CallManager, probe: &LoopbackProbe) -> anyhow::Result<()> {
    info!("=== Call Lifecycle Demo ===");
    let logger: Rc<dyn CallListener> = Rc::new(StateLogger);
    let audit = Rc::new(EventLog::new());
    let audit_listener: Rc<dyn CoreListener> = audit.clone();
    manager.add_listener(audit_listener.clone());

    // Incoming call from Alice, answered
    let alice = manager.handle_incoming(
        Box::new(LoopbackSession::new(probe.clone())),
        &SipUri::parse("sip:alice@example.com")?,
        manager.identity(),
        None,
    )?;
    alice.add_listener(logger.clone());
    alice.accept(None)?;
    alice.on_session_state_changed(CallState::StreamsRunning, "Streams running")?;
    alice.send_dtmfs("1234#")?;

    // Hold and resume
    alice.pause()?;
    alice.on_session_state_changed(CallState::Paused, "Call paused")?;
    alice.resume()?;
    alice.on_session_state_changed(CallState::StreamsRunning, "Call resumed")?;

    // Blind transfer of Alice to Bob
    alice.transfer(TransferTarget::Address(SipUri::parse("sip:bob@example.com")?))?;
    if let Some(bob) = alice.transfer_target_call() {
        bob.add_listener(logger.clone());
        bob.on_session_state_changed(CallState::OutgoingRinging, "Ringing")?;
        bob.on_session_state_changed(CallState::Connected, "Connected")?;
        info!("Transfer state of Alice: {}", alice.transfer_state());
        bob.terminate(None)?;
    }

    // Outgoing call to Carol, cancelled before the answer
    let carol = manager.invite(
        &SipUri::parse("sip:carol@example.com")?,
        Some(MediaParams::default()),
    )?;
    carol.add_listener(logger);
    carol.on_session_state_changed(CallState::OutgoingRinging, "Ringing")?;
    carol.terminate(None)?;

    alice.terminate(None)?;

    manager.remove_listener(&audit_listener);
    for event in audit.take_events() {
        debug!("Audit: {}", event.to_json()?);
    }

    info!("Statistics: {:?}", manager.statistics());
    info!("Session primitives issued: {}", probe.commands().len());
    info!("=== Call Lifecycle Demo Complete ===");
    Ok(())
}
