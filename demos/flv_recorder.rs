//! Records one RTMP stream to an FLV file
//!
//! Run with: cargo run --example flv_recorder -- rtmp://localhost/live camera output.flv
//!
//! Stops on Ctrl+C or when the server ends the session.

use rtmp_client::media::FlvMuxer;
use rtmp_client::{ClientConfig, RtmpClient, SessionEvent};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("rtmp_client=debug".parse()?)
                .add_directive("flv_recorder=info".parse()?),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let (Some(url), Some(name), Some(path)) = (args.next(), args.next(), args.next()) else {
        eprintln!("Usage: flv_recorder <rtmp_url> <stream_name> <output.flv>");
        std::process::exit(1);
    };

    let client = RtmpClient::connect(ClientConfig::new(&url)).await?;
    println!("Connected to {} as {:?}", url, client.client_id());

    let mut events = client.subscribe();
    let stream = client.create_stream().await?;
    let media = stream.subscribe_media();
    stream.play(&name).await?;
    println!("Recording {} to {}", name, path);

    let file = tokio::fs::File::create(&path).await?;
    let mut muxer = FlvMuxer::new(tokio::io::BufWriter::new(file), true, true);
    let recorder = tokio::spawn(async move {
        let result = muxer.run(media).await;
        (muxer.dropped(), result)
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => println!("Stopping"),
        _ = async {
            while let Ok(event) = events.recv().await {
                match event {
                    SessionEvent::Status(status) => {
                        println!("Status: {}", status.get_string("code").unwrap_or("?"));
                    }
                    SessionEvent::Disconnected(cause) => {
                        println!("Disconnected: {}", cause);
                        break;
                    }
                    _ => {}
                }
            }
        } => {}
    }

    // Deleting the stream closes the media feed, which ends the muxer
    let _ = stream.delete().await;
    client.close().await;

    let (dropped, result) = recorder.await?;
    result?;
    println!("Done, {} out-of-order packets dropped", dropped);
    Ok(())
}
