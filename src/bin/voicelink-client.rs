use voicelink::{Client, ClientEvent};

fn main() {
    env_logger::init();
    let mut args = std::env::args().skip(1);
    let addr = args.next().unwrap_or_else(|| "127.0.0.1:4242".to_string());
    let nickname = args.next().unwrap_or_else(|| "guest".to_string());

    let mut client = Client::connect(addr.as_str()).expect("failed to connect");
    println!("connected as network id {}", client.network_id());
    client.login(&nickname, None, None).expect("failed to send login");

    while let Some(event) = client.recv() {
        match &event {
            ClientEvent::Audio { source_id, frame } => {
                log::debug!("audio frame from source {source_id}: {} bytes", frame.len());
            }
            other => println!("{other:?}"),
        }
        if matches!(event, ClientEvent::Disconnected { .. }) {
            break;
        }
    }
}
