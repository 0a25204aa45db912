//! Callback session example against the in-process loopback broker.
//!
//! Run with: cargo run -p mqsession --example callback
//!
//! Settings come from `mqsession.toml` when present, otherwise defaults,
//! with `MQSESSION__*` environment overrides applied on top.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use mqsession::loopback::LoopbackBroker;
use mqsession::{Client, ClientConfig, Message, QoS, Will};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = ClientConfig::load("mqsession.toml")?;

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&config.log_level))
        .init();

    let broker = LoopbackBroker::new();
    let client = Client::new("callback-example", config, broker.clone())?;

    client.set_will(Will::new("clients/callback-example/status", "offline").retain(true));

    let received = Arc::new(AtomicUsize::new(0));

    client.on_connect(|client, rc| {
        println!("Connected (rc={})", rc);
        client.subscribe("sensors/#", QoS::AtLeastOnce)?;
        Ok(())
    });

    client.on_subscribe(|client, mid, granted| {
        println!("Subscription {} granted {:?}", mid, granted);
        client.publish("sensors/temp", b"25.5", QoS::AtLeastOnce, false)?;
        client.publish("sensors/humidity", b"60", QoS::AtMostOnce, false)?;
        Ok(())
    });

    let count = received.clone();
    client.on_message(move |_, msg| {
        let n = count.fetch_add(1, Ordering::Relaxed) + 1;
        println!(
            "[{}] {} -> {}",
            n,
            msg.topic,
            String::from_utf8_lossy(&msg.payload)
        );
        Ok(())
    });

    client.on_publish(|_, mid| {
        println!("Publish {} acknowledged", mid);
        Ok(())
    });

    client.on_disconnect(|_, reason, will_reconnect| {
        println!("Disconnected: {} (reconnecting: {})", reason, will_reconnect);
        Ok(())
    });

    client.connect("localhost", 1883, 60)?;

    thread::sleep(Duration::from_millis(500));
    broker.inject(Message::new("sensors/door", "open"));
    thread::sleep(Duration::from_millis(500));

    println!("Received {} messages", received.load(Ordering::Relaxed));
    client.disconnect()?;
    thread::sleep(Duration::from_millis(200));

    Ok(())
}
