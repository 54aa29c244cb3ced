//! FIPC round-trip latency benchmark.
//!
//! Measures write → echo → read latency for small packets over one
//! connection, single-process, and prints a percentile summary.
//!
//! Usage:
//!     cargo run --release -p fipc-bench [iterations] [payload_bytes]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use fipc::{ConnectedArgs, Server, Socket};

fn arm_echo(socket: &Arc<dyn Socket>) {
    let _ = socket.read(
        Box::new(|socket, result, _data| {
            if let Ok(payload) = result {
                let _ = socket.write(payload, Box::new(|_, _, _| {}), None);
                arm_echo(socket);
            }
        }),
        None,
    );
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    let idx = ((sorted.len() as f64 - 1.0) * p / 100.0).round() as usize;
    sorted[idx]
}

fn main() -> Result<(), fipc::Error> {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let iterations: usize = args
        .next()
        .and_then(|a| a.parse().ok())
        .unwrap_or(10_000);
    let payload_bytes: usize = args.next().and_then(|a| a.parse().ok()).unwrap_or(64);

    let name = format!("fipc-bench-{}", std::process::id());
    let server = fipc::server();
    server.set_path(&name)?;
    server.connected().add(|args: &mut ConnectedArgs| {
        args.allow = true;
        arm_echo(&args.socket);
    });
    server.open()?;

    let stop = Arc::new(AtomicBool::new(false));
    let worker = {
        let server = server.clone();
        let stop = stop.clone();
        std::thread::spawn(move || {
            while !stop.load(Ordering::Acquire) {
                let _ = server.work(Duration::from_millis(20));
            }
        })
    };

    let client = fipc::socket()?;
    client.set_path(&name)?;
    client.open()?;

    let payload = vec![0x55u8; payload_bytes];
    let mut samples = Vec::with_capacity(iterations);

    println!("{iterations} round trips, {payload_bytes} byte payload");
    for _ in 0..iterations {
        let (tx, rx) = mpsc::channel::<()>();
        client.read(
            Box::new(move |_socket, result, _data| {
                if result.is_ok() {
                    let _ = tx.send(());
                }
            }),
            None,
        )?;

        let start = Instant::now();
        client.write(&payload, Box::new(|_, _, _| {}), None)?;
        loop {
            if rx.try_recv().is_ok() {
                break;
            }
            let _ = client.work(Duration::from_millis(10));
        }
        samples.push(start.elapsed());
    }

    samples.sort();
    let total: Duration = samples.iter().sum();
    println!("avg:  {:>10.2?}", total / samples.len() as u32);
    println!("p50:  {:>10.2?}", percentile(&samples, 50.0));
    println!("p90:  {:>10.2?}", percentile(&samples, 90.0));
    println!("p99:  {:>10.2?}", percentile(&samples, 99.0));
    println!("max:  {:>10.2?}", samples[samples.len() - 1]);

    client.close()?;
    stop.store(true, Ordering::Release);
    server.close()?;
    worker.join().expect("worker panicked");
    Ok(())
}
