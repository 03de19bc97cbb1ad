use std::rc::Rc;
use std::time::Duration;

use fcgi_driver::{Config, Driver, Handler, HandlerEvent, PageArbiter, Request, Scheduler};


/// Greets the caller and lists what it sent.
struct Hello;

impl Handler for Hello {
    // Nothing to prepare before the body arrives
    fn exec(&self, _request: &mut Request) {}

    fn done(&self, request: &mut Request) {
        let name = request.params().get_str(b"name").unwrap_or("world").to_owned();
        let method = request.method().map_or("?", Into::into);
        let uri = request.uri().to_owned();

        request.write_str("Content-Type: text/plain; charset=utf-8\r\n\r\n");
        request.write_str(&format!("Hello, {name}!\n\n{method} {uri}\n"));
        request.write_str(&format!("{} parameters, {} body bytes\n", request.params().len(), request.body_size()));
        let uploads: Vec<_> = request.uploads().iter()
            .map(|u| format!("upload {}: {} ({} bytes)\n", u.field, u.external, u.bytes))
            .collect();
        for line in uploads {
            request.write_str(&line);
        }
        request.end(0);
    }

    fn event(&self, event: HandlerEvent) {
        tracing::debug!(?event, "hello handler notified");
    }
}

/// Routes everything below `/hello` to [`Hello`].
struct Routes {
    hello: Rc<Hello>,
}

impl PageArbiter for Routes {
    fn match_page(&mut self, request: &mut Request) -> bool {
        if !request.uri().starts_with("/hello") {
            return false;
        }
        request.set_handler(self.hello.clone());
        true
    }

    fn event(&mut self, event: HandlerEvent) {
        self.hello.event(event);
    }
}


fn main() {
    init_tracing();
    let path = std::env::args().nth(1).unwrap_or_else(|| "/tmp/fcgi-hello.sock".to_owned());

    let config = Config::with_requests(10).upload_dir(std::env::temp_dir());
    let driver = Driver::new(config, Routes { hello: Rc::new(Hello) });

    // Exit after five minutes without requests, the process manager restarts us on demand
    let mut scheduler = match Scheduler::bind(driver, &path, Duration::from_secs(300)) {
        Ok(s) => s,
        Err(e) => {
            let error: &dyn std::error::Error = &e;
            tracing::error!(error, "cannot start server");
            std::process::exit(1);
        },
    };

    loop {
        match scheduler.run() {
            Ok(true) => {},
            Ok(false) => break,
            Err(e) => {
                let error: &dyn std::error::Error = &e;
                tracing::error!(error, "server loop failed");
                break;
            },
        }
    }
    tracing::info!(served = scheduler.driver().served_count(), "shutting down");
}


/// Sets up a basic `tracing` subscriber to stderr. Its verbosity level is
/// configured with the `RUST_LOG` environment variable.
fn init_tracing() {
    use tracing_subscriber::{filter::LevelFilter, fmt};
    let max_level = match std::env::var("RUST_LOG") {
        Ok(var) if !var.is_empty() => var.parse::<LevelFilter>().unwrap_or_else(|e| {
            eprintln!("Ignoring `RUST_LOG={var}`: {e}");
            LevelFilter::INFO
        }),
        _ => LevelFilter::INFO,
    };

    fmt::fmt()
        .with_timer(fmt::time::uptime())
        .with_max_level(max_level)
        .with_writer(std::io::stderr)
        .init();
}
