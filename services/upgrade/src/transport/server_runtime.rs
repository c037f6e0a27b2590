use std::{
    net::{TcpListener, TcpStream},
    sync::{Arc, Mutex, mpsc},
    time::Duration,
};

use tracing::{info, warn};

use super::{
    DEFAULT_HTTP_WORKERS, HttpResponse, SOCKET_TIMEOUT_SECS, SharedRuntime, handle_request,
    http::write_response, request::read_http_request,
};

pub fn serve_http(runtime: SharedRuntime, bind_addr: &str) -> std::io::Result<()> {
    serve_http_with_workers(runtime, bind_addr, DEFAULT_HTTP_WORKERS)
}

/// Accepts connections on `bind_addr` and hands them to a fixed pool of
/// worker threads. Returns once the listener stops yielding connections.
pub fn serve_http_with_workers(
    runtime: SharedRuntime,
    bind_addr: &str,
    worker_count: usize,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(bind_addr)?;
    let worker_count = worker_count.max(1);
    let (tx, rx) = mpsc::channel::<TcpStream>();
    let rx = Arc::new(Mutex::new(rx));
    info!(bind_addr, worker_count, "upgrade transport listening");

    std::thread::scope(|scope| {
        for _ in 0..worker_count {
            let runtime = Arc::clone(&runtime);
            let rx = Arc::clone(&rx);
            scope.spawn(move || {
                loop {
                    let stream = {
                        let guard = match rx.lock() {
                            Ok(guard) => guard,
                            Err(_) => break,
                        };
                        match guard.recv() {
                            Ok(stream) => stream,
                            Err(_) => break,
                        }
                    };
                    if let Err(err) = handle_connection(&runtime, stream) {
                        warn!(error = %err, "upgrade transport connection error");
                    }
                }
            });
        }

        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    if tx.send(stream).is_err() {
                        warn!("upgrade transport worker queue closed");
                        break;
                    }
                }
                Err(err) => warn!(error = %err, "upgrade transport accept error"),
            }
        }
        drop(tx);
    });

    Ok(())
}

fn handle_connection(runtime: &SharedRuntime, mut stream: TcpStream) -> std::io::Result<()> {
    stream.set_read_timeout(Some(Duration::from_secs(SOCKET_TIMEOUT_SECS)))?;
    stream.set_write_timeout(Some(Duration::from_secs(SOCKET_TIMEOUT_SECS)))?;

    let request = match read_http_request(&mut stream) {
        Ok(Some(request)) => request,
        Ok(None) => return Ok(()),
        Err(err) => return write_response(&mut stream, HttpResponse::bad_request(&err)),
    };

    let response = handle_request(runtime, &request);
    write_response(&mut stream, response)
}
