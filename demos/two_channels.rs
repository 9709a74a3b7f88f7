use clap::Parser;
use packetmux::{ClaimFn, MuxConfig, MuxError, Multiplexer, PacketFilter, UdpTransport};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, Level};

/// first byte of control packets
const CONTROL_MARKER: u8 = 0xff;

/// Binds a UDP socket, shares it between a control channel and a catch-all data channel, and
///  sends itself a mix of packets to show how they are dispatched.
#[derive(Parser)]
struct Args {
    #[clap(long, default_value = "127.0.0.1:0")]
    bind_address: String,

    #[clap(long, default_value_t = 5)]
    num_packets: u8,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose { Level::TRACE } else { Level::INFO })
        .try_init()
        .ok();

    let bind_address: SocketAddr = args.bind_address.parse()?;
    let transport = UdpTransport::bind(bind_address).await?;
    let mux = Multiplexer::new(Arc::new(transport), MuxConfig::default_ipv4())?;
    let self_addr = mux.local_addr()?;

    let control_filter: Arc<dyn PacketFilter> = Arc::new(ClaimFn(|buf: &[u8], _: Option<SocketAddr>| {
        buf.first() == Some(&CONTROL_MARKER)
    }));
    let control = mux.register_connection(0, Some(control_filter));
    let data = mux.register_connection(100, None);
    mux.start();

    for i in 0..args.num_packets {
        data.send_to(format!("data #{}", i).as_bytes(), self_addr).await?;
        if i % 2 == 0 {
            control.send_to(&[CONTROL_MARKER, i], self_addr).await?;
        }
    }

    let deadline = Instant::now() + Duration::from_millis(500);
    control.set_read_deadline(Some(deadline));
    data.set_read_deadline(Some(deadline));

    let mut buf = vec![0u8; mux.config().max_packet_size];
    loop {
        match control.recv_from(&mut buf).await {
            Ok((len, from)) => info!("control channel: {:?} from {:?}", &buf[..len], from),
            Err(MuxError::DeadlineExceeded) => break,
            Err(e) => return Err(e.into()),
        }
    }
    loop {
        match data.recv_from(&mut buf).await {
            Ok((len, from)) => info!("data channel: {:?} from {:?}", String::from_utf8_lossy(&buf[..len]), from),
            Err(MuxError::DeadlineExceeded) => break,
            Err(e) => return Err(e.into()),
        }
    }

    info!("unclaimed packets: {}", mux.dropped_count());
    control.close()?;
    data.close()?;
    Ok(())
}
