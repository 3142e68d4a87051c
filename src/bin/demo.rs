use clap::{App, Arg};
use colored::*;
use softbus::telemetry::decode_packet;
use softbus::{
    msg_ids, BusCommand, BusConfig, BusServices, CcsdsHeader, CommandTask, HousekeepingTlm,
    MsgId, OverflowPolicy, PipeId, PipeOptions, Received, SoftwareBus, TaskRegistry, Timeout,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{info, warn};

const NAV_TLM_MID: MsgId = MsgId::new(0x0801);
const PUBLISH_PERIOD_MS: u64 = 20;
const RECEIVE_IDLE_MS: u32 = 500;

type DemoResult = Result<(), Box<dyn std::error::Error>>;

#[tokio::main]
async fn main() -> DemoResult {
    let matches = App::new("softbus-demo")
        .version("0.1.0")
        .author("Space Systems Engineering Team")
        .about("Software bus demonstration: publishers, subscribers and the command pipe")
        .arg(
            Arg::with_name("scenario")
                .short("s")
                .long("scenario")
                .value_name("SCENARIO")
                .help("Which scenario to run")
                .takes_value(true)
                .possible_values(&["fanout", "overflow", "commands"])
                .default_value("fanout"),
        )
        .arg(
            Arg::with_name("messages")
                .short("n")
                .long("messages")
                .value_name("COUNT")
                .help("Messages to publish")
                .takes_value(true)
                .default_value("50")
                .validator(|v| match v.parse::<u32>() {
                    Ok(n) if n > 0 => Ok(()),
                    _ => Err("Message count must be a positive number".into()),
                }),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Log bus events at debug level"),
        )
        .get_matches();

    if matches.is_present("verbose") {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .init();
    } else {
        tracing_subscriber::fmt::init();
    }

    let messages: u32 = matches.value_of("messages").unwrap_or("50").parse()?;
    let scenario = matches.value_of("scenario").unwrap_or("fanout");

    let registry = Arc::new(TaskRegistry::new());
    let config = BusConfig::default();
    let bus = Arc::new(SoftwareBus::new(
        config.clone(),
        BusServices::new(registry.clone(), &config),
    )?);

    println!("{}", format!("Software bus demo: {scenario}").bright_blue().bold());

    match scenario {
        "overflow" => run_overflow(&bus, &registry, messages).await?,
        "commands" => run_commands(&bus, &registry).await?,
        _ => run_fanout(&bus, &registry, messages).await?,
    }

    print_summary(&bus);
    Ok(())
}

/// Create a pipe owned by `app` and subscribe it to the navigation telemetry.
fn subscriber_pipe(
    bus: &SoftwareBus,
    registry: &TaskRegistry,
    app_name: &str,
    depth: u16,
    options: PipeOptions,
) -> Result<PipeId, Box<dyn std::error::Error>> {
    let app = registry.register_app(app_name)?;
    registry.bind_current_thread(app)?;
    let pipe = bus.create_pipe(depth, &format!("{app_name}_PIPE"))?;
    bus.set_pipe_opts(pipe, options)?;
    bus.subscribe_ex(NAV_TLM_MID, pipe, softbus::Qos::DEFAULT, depth)?;
    Ok(pipe)
}

/// Drain `pipe` on a blocking thread until it has been idle for a while.
fn spawn_receiver(bus: Arc<SoftwareBus>, name: &'static str, pipe: PipeId) -> JoinHandle<u32> {
    tokio::task::spawn_blocking(move || {
        let mut received = 0u32;
        loop {
            match bus.receive_buffer(pipe, Timeout::Millis(RECEIVE_IDLE_MS)) {
                Ok(Received::Message(_)) => received += 1,
                Ok(Received::NoMessage | Received::TimedOut) => break,
                Err(err) => {
                    warn!(subscriber = name, %err, "receive failed");
                    break;
                }
            }
        }
        info!(subscriber = name, received, "subscriber finished");
        received
    })
}

async fn publish(bus: &SoftwareBus, registry: &TaskRegistry, messages: u32) -> DemoResult {
    let publisher = registry.register_app("PUBLISHER")?;
    registry.bind_current_thread(publisher)?;

    let header = CcsdsHeader::new();
    let mut interval = time::interval(Duration::from_millis(PUBLISH_PERIOD_MS));
    for n in 0..messages {
        interval.tick().await;
        let packet = header.build_telemetry(NAV_TLM_MID, n, 0, &n.to_be_bytes())?;
        match bus.transmit_msg(&packet, true) {
            Ok(report) => info!(
                seq = n,
                delivered = report.delivered,
                dropped = report.dropped,
                "published"
            ),
            Err(err) => warn!(seq = n, %err, "publish failed"),
        }
    }
    Ok(())
}

async fn run_fanout(bus: &Arc<SoftwareBus>, registry: &TaskRegistry, messages: u32) -> DemoResult {
    let mut receivers = Vec::new();
    for name in ["NAV", "GNC", "LOGGER"] {
        let pipe = subscriber_pipe(bus, registry, name, 16, PipeOptions::new())?;
        receivers.push((name, spawn_receiver(bus.clone(), name, pipe)));
    }

    publish(bus, registry, messages).await?;

    for (name, receiver) in receivers {
        let received = receiver.await?;
        println!("  {} received {}", name.bright_white(), received.to_string().bright_cyan());
    }
    Ok(())
}

async fn run_overflow(bus: &Arc<SoftwareBus>, registry: &TaskRegistry, messages: u32) -> DemoResult {
    let fast = subscriber_pipe(bus, registry, "FAST", 64, PipeOptions::new())?;
    let slow = subscriber_pipe(
        bus,
        registry,
        "SLOW",
        4,
        PipeOptions::new().with_overflow(OverflowPolicy::Drop),
    )?;
    let fast_receiver = spawn_receiver(bus.clone(), "FAST", fast);

    // SLOW does not read until the publisher is done
    publish(bus, registry, messages).await?;
    let slow_receiver = spawn_receiver(bus.clone(), "SLOW", slow);

    println!("  {} received {}", "FAST".bright_white(), fast_receiver.await?.to_string().bright_cyan());
    println!("  {} received {}", "SLOW".bright_white(), slow_receiver.await?.to_string().yellow());
    Ok(())
}

async fn run_commands(bus: &Arc<SoftwareBus>, registry: &Arc<TaskRegistry>) -> DemoResult {
    let bus_app = registry.register_app("SB")?;
    let task = CommandTask::new(bus.clone(), bus_app)?;
    let stop = Arc::new(AtomicBool::new(false));

    let runner = {
        let stop = stop.clone();
        tokio::task::spawn_blocking(move || task.run(&stop))
    };

    let ground = registry.register_app("GROUND")?;
    registry.bind_current_thread(ground)?;
    let hk_pipe = bus.create_pipe(4, "GROUND_HK")?;
    bus.subscribe(msg_ids::HK_TLM_MID, hk_pipe)?;

    for command in [
        BusCommand::Noop,
        BusCommand::SendStats,
        BusCommand::EnableSubReporting,
        BusCommand::SendHousekeeping,
    ] {
        bus.transmit_msg(&command.encode()?, true)?;
        time::sleep(Duration::from_millis(PUBLISH_PERIOD_MS)).await;
    }

    let hk_bus = bus.clone();
    let housekeeping = tokio::task::spawn_blocking(move || {
        let message = hk_bus.receive_buffer(hk_pipe, Timeout::Millis(RECEIVE_IDLE_MS)).ok()?.message()?;
        let packet = hk_bus.copy_message(message.buffer).ok()?;
        decode_packet::<HousekeepingTlm>(&packet).ok()
    })
    .await?;

    stop.store(true, Ordering::Relaxed);
    runner.await?;

    match housekeeping {
        Some(hk) => println!(
            "  {} commands accepted {}, rejected {}",
            "HK".bright_white(),
            hk.counters.command_counter.to_string().green(),
            hk.counters.command_error_counter.to_string().red()
        ),
        None => println!("{} {}", "❌".red(), "No housekeeping packet received".bright_red()),
    }
    Ok(())
}

fn print_summary(bus: &SoftwareBus) {
    let hk = bus.housekeeping();
    let stats = bus.stats();
    let counters = hk.counters;

    println!("\n{}", "📊 Bus Summary".bright_blue().bold());
    println!("  {:<28} {}", "Pipes in use", format!("{}/{}", stats.pipes_in_use, stats.max_pipes_allowed).bright_cyan());
    println!("  {:<28} {}", "Message ids in use", stats.msg_ids_in_use.to_string().bright_cyan());
    println!("  {:<28} {}", "Subscriptions", stats.subscriptions_in_use.to_string().bright_cyan());
    println!("  {:<28} {}", "Peak buffers in use", stats.peak_sb_buffers_in_use.to_string().bright_cyan());
    println!("  {:<28} {}", "Peak pool bytes", stats.peak_mem_in_use.to_string().bright_cyan());
    println!("  {:<28} {}", "Free pool bytes", hk.unmarked_mem.to_string().bright_cyan());

    let errors = [
        ("No subscribers", counters.no_subscribers_counter),
        ("Send errors", counters.msg_send_error_counter),
        ("Pipe overflow errors", counters.pipe_overflow_error_counter),
        ("Pipe overflow drops", counters.pipe_overflow_drop_counter),
        ("Message limit errors", counters.msg_limit_error_counter),
        ("Internal errors", counters.internal_error_counter),
    ];
    for (label, value) in errors {
        let shown = if value == 0 {
            value.to_string().green()
        } else {
            value.to_string().yellow()
        };
        println!("  {label:<28} {shown}");
    }
}
