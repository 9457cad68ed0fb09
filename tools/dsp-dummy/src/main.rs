#![forbid(unsafe_code)]

use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use dspbridge::sim::SimulatedBridge;
use dspbridge::{
    Buffer, BufferConfig, CancellationToken, ControlChannel, Direction, DspUuid, GuardPages,
    LoopbackPattern, MessageChannel, Node, NodeState, ProcessorSession, DEFAULT_ALIGNMENT,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Node image installed in the simulated bridge.
const LOOPBACK: DspUuid = DspUuid::from_fields(
    0x3dac_26d0,
    0x6d4b,
    0x11dd,
    [0xad, 0x8b, 0x08, 0x00, 0x20, 0x0c, 0x9a, 0x66],
);
const LOOPBACK_NODE: &str = "3dac26d0-6d4b-11dd-ad8b-0800200c9a66";

#[derive(Parser, Debug)]
#[command(
    name = "dsp-dummy",
    about = "Drive a loopback node through the DSP bridge: map an input and an output buffer, \
             run work cycles over them, then tear everything down."
)]
struct Args {
    /// Raise log verbosity to debug
    #[arg(short, long, action = clap::ArgAction::SetTrue)]
    debug: bool,

    /// Number of work cycles to run; 0 runs until interrupted
    #[arg(short = 'n', long, env = "DSP_DUMMY_NTIMES", default_value_t = 1000)]
    ntimes: u64,

    /// Size of each shared buffer in bytes
    #[arg(long, env = "DSP_DUMMY_BUFFER_SIZE", value_name = "BYTES", default_value_t = 4096)]
    buffer_size: usize,

    /// Host alignment of buffer storage (power of two; 0 or 1 for unaligned)
    #[arg(
        long,
        env = "DSP_DUMMY_ALIGNMENT",
        value_name = "BYTES",
        default_value_t = DEFAULT_ALIGNMENT
    )]
    alignment: usize,

    /// Guard pages added to every address-space reservation
    #[arg(
        long,
        env = "DSP_DUMMY_GUARD_PAGES",
        default_value_t = 1,
        value_parser = clap::value_parser!(u32).range(1..=2)
    )]
    guard_pages: u32,

    /// Index of the accelerator to attach to
    #[arg(long, env = "DSP_DUMMY_PROCESSOR", default_value_t = 0)]
    processor: u32,

    /// Node to instantiate
    #[arg(long, env = "DSP_DUMMY_NODE", default_value = LOOPBACK_NODE)]
    node: DspUuid,

    /// Fill the input every cycle and check the node echoed it to the output
    #[arg(long, action = clap::ArgAction::SetTrue)]
    verify: bool,
}

fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_env("DSP_DUMMY_LOG").unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.debug);

    let cancel = CancellationToken::new();
    let watcher = tokio::spawn(cancel_on_interrupt(cancel.clone()));

    let worker = tokio::task::spawn_blocking({
        let cancel = cancel.clone();
        move || drive(&args, &cancel)
    });
    let result = match worker.await {
        Ok(result) => result,
        Err(err) => Err(anyhow::Error::new(err).context("work thread panicked")),
    };
    watcher.abort();

    match result {
        Ok(completed) => {
            info!(completed, "clean shutdown");
            println!("{completed} cycles completed");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn cancel_on_interrupt(cancel: CancellationToken) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("interrupt received; stopping after the current cycle");
            cancel.cancel();
        }
        Err(err) => warn!("failed to install Ctrl+C handler: {err}"),
    }
}

fn drive(args: &Args, cancel: &CancellationToken) -> anyhow::Result<u64> {
    let guard_pages = GuardPages::try_from(args.guard_pages)?;
    let config = BufferConfig::new(args.alignment, guard_pages)
        .context("invalid buffer configuration")?;

    let bridge = SimulatedBridge::new().with_loopback_node(LOOPBACK);
    let session = ProcessorSession::open_with_config(&bridge, args.processor, config)
        .with_context(|| format!("failed to attach to processor {}", args.processor))?;

    let result = exercise(&session, args, cancel);
    let closed = session.close().context("failed to close bridge session");
    let completed = result?;
    closed?;
    Ok(completed)
}

/// Sets up buffers and the node, runs the loop, then tears down in strict order: buffers are
/// unmapped and freed, then the node is terminated and deleted. Every teardown step is attempted
/// even when an earlier one fails.
fn exercise<C: ControlChannel>(
    session: &ProcessorSession<C>,
    args: &Args,
    cancel: &CancellationToken,
) -> anyhow::Result<u64> {
    let mut input = session.create_buffer(Direction::ToDevice);
    let mut output = session.create_buffer(Direction::FromDevice);
    let mut node = None;

    let outcome = run(session, &mut input, &mut output, &mut node, args, cancel);
    let output_released = release_buffer(output, "output");
    let input_released = release_buffer(input, "input");
    let node_released = node.map_or(Ok(()), release_node);

    let completed = outcome?;
    output_released?;
    input_released?;
    node_released?;
    Ok(completed)
}

fn run<'s, C: ControlChannel>(
    session: &'s ProcessorSession<C>,
    input: &mut Buffer<'s, C>,
    output: &mut Buffer<'s, C>,
    node: &mut Option<Node<'s, C>>,
    args: &Args,
    cancel: &CancellationToken,
) -> anyhow::Result<u64> {
    input
        .allocate(args.buffer_size)
        .context("failed to allocate input buffer")?;
    input.map().context("failed to map input buffer")?;
    output
        .allocate(args.buffer_size)
        .context("failed to allocate output buffer")?;
    output.map().context("failed to map output buffer")?;

    let node = node.insert(
        session
            .allocate_node(args.node, None)
            .with_context(|| format!("failed to allocate node {}", args.node))?,
    );
    node.create().context("failed to create node")?;
    node.run().context("failed to run node")?;

    let mut channel = MessageChannel::new(node);
    let looped = work(&mut channel, input, output, args, cancel);
    if let Err(err) = channel.shutdown() {
        error!(%err, "failed to send shutdown to node");
    }
    looped
}

fn release_buffer<C: ControlChannel>(mut buffer: Buffer<'_, C>, name: &str) -> anyhow::Result<()> {
    let unmapped = buffer
        .unmap()
        .with_context(|| format!("failed to unmap {name} buffer"));
    let freed = buffer
        .free()
        .with_context(|| format!("failed to free {name} buffer"));
    unmapped.and(freed)
}

/// Terminates a started node, then deletes it whether or not termination succeeded.
fn release_node<C: ControlChannel>(mut node: Node<'_, C>) -> anyhow::Result<()> {
    let terminated = if matches!(node.state(), NodeState::Running | NodeState::Paused) {
        node.terminate()
            .map(|status| info!("node terminated with exit status {status:#x}"))
            .context("failed to terminate node")
    } else {
        Ok(())
    };
    if let Err(err) = &terminated {
        error!("{err:#}");
    }
    let freed = node.free().context("failed to delete node");
    terminated.and(freed)
}

fn work<C: ControlChannel>(
    channel: &mut MessageChannel<'_, '_, C>,
    input: &mut Buffer<'_, C>,
    output: &mut Buffer<'_, C>,
    args: &Args,
    cancel: &CancellationToken,
) -> anyhow::Result<u64> {
    channel
        .configure(input, output)
        .context("failed to configure node")?;
    let completed = if args.verify {
        channel.run_loop(input, output, args.ntimes, cancel, &mut LoopbackPattern)
    } else {
        channel.run_loop(input, output, args.ntimes, cancel, &mut ())
    };
    completed.context("work loop failed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use dspbridge::{ChannelError, RequestKind};

    fn args(extra: &[&str]) -> Args {
        Args::parse_from(std::iter::once("dsp-dummy").chain(extra.iter().copied()))
    }

    #[test]
    fn teardown_releases_buffers_before_the_node() {
        let bridge = SimulatedBridge::new().with_loopback_node(LOOPBACK);
        let session = ProcessorSession::open(&bridge, 0).unwrap();
        let completed = exercise(&session, &args(&["-n", "3"]), &CancellationToken::new());
        assert_eq!(completed.unwrap(), 3);
        session.close().unwrap();

        let log = bridge.requests();
        assert_eq!(
            log[log.len() - 9..],
            [
                RequestKind::NodePutMessage,
                RequestKind::Unmap,
                RequestKind::Unreserve,
                RequestKind::Unmap,
                RequestKind::Unreserve,
                RequestKind::NodeTerminate,
                RequestKind::NodeDelete,
                RequestKind::Detach,
                RequestKind::Close,
            ]
        );
        assert_eq!(bridge.live_nodes(), 0);
        assert_eq!(bridge.live_mappings(), 0);
    }

    #[test]
    fn failed_terminate_still_deletes_after_the_buffers() {
        let bridge = SimulatedBridge::new().with_loopback_node(LOOPBACK);
        bridge.fail_next(RequestKind::NodeTerminate, ChannelError::Disconnected);
        let session = ProcessorSession::open(&bridge, 0).unwrap();
        let err = exercise(&session, &args(&["-n", "1"]), &CancellationToken::new()).unwrap_err();
        assert!(format!("{err:#}").contains("failed to terminate node"));

        let log = bridge.requests();
        let last_unmap = log.iter().rposition(|&k| k == RequestKind::Unmap).unwrap();
        let terminate = log.iter().position(|&k| k == RequestKind::NodeTerminate).unwrap();
        let delete = log.iter().position(|&k| k == RequestKind::NodeDelete).unwrap();
        assert!(last_unmap < terminate && terminate < delete);
        assert_eq!(bridge.live_nodes(), 0);
        assert_eq!(bridge.live_mappings(), 0);
    }

    #[test]
    fn buffers_are_released_when_node_allocation_fails() {
        let bridge = SimulatedBridge::new();
        let session = ProcessorSession::open(&bridge, 0).unwrap();
        let err = exercise(&session, &args(&["-n", "1"]), &CancellationToken::new()).unwrap_err();
        assert!(format!("{err:#}").contains("failed to allocate node"));
        assert_eq!(bridge.count(RequestKind::NodeTerminate), 0);
        assert_eq!(bridge.count(RequestKind::NodeDelete), 0);
        assert_eq!(bridge.live_mappings(), 0);
        assert_eq!(bridge.live_reservations(), 0);
    }
}
