//! FIPC echo sample.
//!
//! Server and client in one process: the server admits every connection
//! and echoes each packet back; the client sends a handful of strings and
//! verifies the echoes.
//!
//! Usage:
//!     cargo run -p fipc-echo

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use fipc::{ConnectedArgs, Server, Socket};

const MESSAGES: &[&str] = &[
    "This is an introduction to the basics of IPC. It will simply send \
     strings to the other side, with the other side sending them back \
     unmodified.",
    "As this is just a sample, there is no need for this to be as \
     accurate as possible.",
    "Goodbye.",
];

/// Keep one read armed on a socket, echoing every packet back.
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

fn main() -> Result<(), fipc::Error> {
    tracing_subscriber::fmt::init();

    let name = format!("fipc-echo-{}", std::process::id());

    let server = fipc::server();
    server.set_path(&name)?;
    server.connected().add(|args: &mut ConnectedArgs| {
        args.allow = true;
        println!("server: connection admitted");
        arm_echo(&args.socket);
    });
    server.open()?;

    // One worker thread drives the server's completions.
    let stop = Arc::new(AtomicBool::new(false));
    let worker = {
        let server = server.clone();
        let stop = stop.clone();
        std::thread::spawn(move || {
            while !stop.load(Ordering::Acquire) {
                let _ = server.work(Duration::from_millis(50));
            }
        })
    };

    let client = fipc::socket()?;
    client.set_path(&name)?;
    client.open()?;
    println!("client: connected to {name}");

    for message in MESSAGES {
        let (tx, rx) = mpsc::channel::<Vec<u8>>();
        client.read(
            Box::new(move |_socket, result, _data| {
                if let Ok(payload) = result {
                    let _ = tx.send(payload.to_vec());
                }
            }),
            None,
        )?;
        client.write(message.as_bytes(), Box::new(|_, _, _| {}), None)?;

        let echoed = loop {
            if let Ok(payload) = rx.try_recv() {
                break payload;
            }
            let _ = client.work(Duration::from_millis(10));
        };
        assert_eq!(echoed, message.as_bytes());
        println!("client: echoed {} bytes", echoed.len());
    }

    client.close()?;
    stop.store(true, Ordering::Release);
    server.close()?;
    worker.join().expect("worker panicked");
    println!("done");
    Ok(())
}
