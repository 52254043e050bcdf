use std::{sync::Arc, time::Duration};

use clap::{Parser, Subcommand};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

use tidewire_net::{
    Acceptor, AcceptorConfig, ConcurrentExcept, Connector, EventQueue, EventQueueConfig, NetError,
    NetEvent, Session, SessionHandler, SessionMap, WorkerPool, WorkerPoolConfig,
    dispatch_net_events,
};
use tidewire_proto::{AnyMessage, Codec, MessageRegistry, impl_message};

/// Echo request, answered with the same value.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
struct Echo {
    value: String,
}

/// Normal message the server rebroadcasts to every connected client.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
struct Shout {
    value: String,
}

impl_message!(Echo => "tidewire.Echo", Shout => "tidewire.Shout");

/// Tidewire TCP transport demo
#[derive(Parser, Debug)]
#[command(name = "tidewire-net")]
#[command(about = "Echo server and client over the tidewire transport", long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: Level,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run an echo server.
    Serve {
        /// TCP bind address
        #[arg(short, long, default_value = "0.0.0.0:5300")]
        bind: String,

        /// Worker threads for RPC handling (0 handles everything on the event queue)
        #[arg(long, default_value_t = 0)]
        workers: usize,

        /// Use the JSON codec instead of postcard
        #[arg(long)]
        json: bool,

        /// Trace every packet
        #[arg(long)]
        debug_log: bool,
    },
    /// Send echo requests to a server and print the replies.
    Echo {
        #[arg(short, long, default_value = "127.0.0.1:5300")]
        addr: String,

        #[arg(short, long, default_value = "hello")]
        value: String,

        #[arg(short, long, default_value_t = 1)]
        count: usize,

        /// Use the JSON codec instead of postcard
        #[arg(long)]
        json: bool,
    },
}

fn registry() -> Arc<MessageRegistry> {
    Arc::new(MessageRegistry::with_base_messages().with::<Echo>().with::<Shout>())
}

fn codec(json: bool) -> Codec {
    if json { Codec::Text } else { Codec::Binary }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    match args.command {
        Command::Serve {
            bind,
            workers,
            json,
            debug_log,
        } => serve(bind, workers, codec(json), debug_log).await,
        Command::Echo {
            addr,
            value,
            count,
            json,
        } => echo(addr, value, count, codec(json)).await,
    }
}

/// Answers `Echo` requests and rebroadcasts `Shout` messages to every client.
#[derive(Default)]
struct EchoServer {
    sessions: Mutex<SessionMap>,
}

impl SessionHandler for EchoServer {
    fn on_session_connected(&self, session: &Arc<Session>) {
        info!(session_id = session.id(), remote = %session.remote_addr(), "client connected");
        self.sessions.lock().add(Arc::clone(session));
    }

    fn on_session_disconnected(&self, session: &Arc<Session>, error: &NetError) {
        info!(session_id = session.id(), error = %error, "client disconnected");
        self.sessions.lock().remove(session);
    }

    fn on_rpc_request(&self, _session: &Arc<Session>, msg: Box<dyn AnyMessage>) -> Box<dyn AnyMessage> {
        match msg.downcast::<Echo>() {
            Ok(echo) => echo as Box<dyn AnyMessage>,
            Err(other) => Box::new(tidewire_proto::messages::base::ErrorReply {
                code: 1,
                message: format!("unsupported request {}", other.msg_id()),
            }),
        }
    }

    fn on_normal_msg(&self, session: &Arc<Session>, msg: Box<dyn AnyMessage>) {
        if msg.is::<Shout>() {
            self.sessions.lock().send_to_all(msg.as_ref());
        } else {
            warn!(session_id = session.id(), msg_id = msg.msg_id(), "unexpected message");
        }
    }
}

async fn serve(bind: String, workers: usize, codec: Codec, debug_log: bool) -> anyhow::Result<()> {
    let pool = (workers > 0).then(|| {
        WorkerPool::new(WorkerPoolConfig {
            capacity: workers,
            ..Default::default()
        })
    });

    let queue = EventQueue::new(EventQueueConfig::default());
    queue.run(None, dispatch_net_events(|_| {}, pool.clone()))?;

    let acceptor = Acceptor::bind(
        bind.as_str(),
        queue.clone(),
        AcceptorConfig {
            codec,
            registry: registry(),
            debug_log,
            ..Default::default()
        },
    )
    .await?;
    acceptor.set_handler(Arc::new(EchoServer::default()));
    // Broadcasts walk the shared session map, keep them on the queue.
    acceptor.set_concurrency(Arc::new(ConcurrentExcept::new().with::<Shout>()));
    acceptor.start_accept();
    info!(addr = %acceptor.local_addr(), %codec, workers, "echo server listening");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    acceptor.close();
    acceptor.closed().await;
    queue.stop().await;
    if let Some(pool) = pool {
        pool.wait_closed();
    }
    Ok(())
}

/// Signals the first connect outcome.
struct ReadySignal {
    tx: mpsc::UnboundedSender<Result<(), String>>,
}

impl SessionHandler for ReadySignal {
    fn on_session_connected(&self, _session: &Arc<Session>) {
        let _ = self.tx.send(Ok(()));
    }
}

async fn echo(addr: String, value: String, count: usize, codec: Codec) -> anyhow::Result<()> {
    let queue: EventQueue<NetEvent> = EventQueue::new(EventQueueConfig::default());
    queue.run(None, dispatch_net_events(|_| {}, None))?;

    let (tx, mut ready) = mpsc::unbounded_channel();
    let failed = tx.clone();
    let connector = Connector::builder(addr, queue.clone())
        .codec(codec)
        .registry(registry())
        .name("echo-client")
        .handler(Arc::new(ReadySignal { tx }))
        .on_connect_failed(move |_, err| {
            let _ = failed.send(Err(err.to_string()));
        })
        .build();
    connector.connect();

    match tokio::time::timeout(Duration::from_secs(5), ready.recv()).await {
        Ok(Some(Ok(()))) => {}
        Ok(Some(Err(e))) => anyhow::bail!("connect to {} failed: {e}", connector.addr()),
        _ => anyhow::bail!("connect to {} timed out", connector.addr()),
    }

    for i in 0..count {
        let request = Echo {
            value: value.clone(),
        };
        match connector.call::<Echo>(&request).await {
            Ok(reply) => println!("{i}: {}", reply.value),
            Err(e) => warn!(seq = i, error = %e, "echo failed"),
        }
    }

    connector.shutdown();
    queue.stop().await;
    Ok(())
}
