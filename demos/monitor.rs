use anyhow::Result;
use structopt::StructOpt;

use prolink_core::{Message, Participant, ParticipantConfig};

#[derive(StructOpt)]
#[structopt(name = "prolink-monitor")]
struct Opt {
    /// Device name announced on the wire.
    #[structopt(long, default_value = "prolink-core")]
    name: String,

    /// Device number to request; 0 self-assigns.
    #[structopt(long, default_value = "0")]
    device_number: u8,

    /// Local interface to bind to; auto-detected if omitted.
    #[structopt(long)]
    interface: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let opt = Opt::from_args();

    let mut config = ParticipantConfig::new();
    config.set_device_name(opt.name)?;
    config.set_device_number(opt.device_number)?;
    config.set_interface_name(opt.interface);

    let mut participant = Participant::new(config);
    participant.start().await?;
    println!("started");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                break;
            }
            res = participant.next() => {
                match res {
                    Ok(msg) => print_message(&msg),
                    Err(e) => {
                        eprintln!("error: {}", e);
                        break;
                    }
                }
            }
        }
    }

    println!("stopping");
    participant.stop().await;

    Ok(())
}

fn print_message(msg: &Message) {
    match msg {
        Message::DeviceJoined(a) => println!("device joined: {} ({})", a.device_number, a.name),
        Message::DeviceLeft(a) => println!("device left: {} ({})", a.device_number, a.name),
        Message::MasterChanged(Some(n)) => println!("master changed: device {}", n),
        Message::MasterChanged(None) => println!("master changed: us"),
        Message::TempoChanged(bpm) => println!("tempo changed: {:.2}", bpm),
        other => println!("{:?}", other),
    }
}
