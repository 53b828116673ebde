use std::{
    cell::{Cell, RefCell},
    io,
    net::SocketAddr,
    rc::Rc,
    time::Duration,
};

use tokio::{
    net::{TcpListener, TcpStream},
    sync::Notify,
    task::JoinHandle,
    time::sleep,
};
use tracing::{error, info};

use crate::{Counter, LocalBoxFuture};

/// Per connection service closure. Invoked once for every accepted stream and
/// run to completion as its own local task.
pub type ConnectionService = Rc<dyn Fn(TcpStream, SocketAddr) -> LocalBoxFuture<()>>;

/// An accept loop owner over a (possibly shared) listening socket.
///
/// Workers do not spawn threads. [Worker::spawn] must be called from inside a
/// `LocalSet`; all connection tasks stay on that thread.
pub struct Worker {
    id: usize,
    listener: Rc<TcpListener>,
    serving: Cell<bool>,
    counter: Counter,
    tasks: RefCell<Vec<JoinHandle<()>>>,
    shutdown: Notify,
}

impl Worker {
    pub fn new(id: usize, listener: Rc<TcpListener>) -> Rc<Self> {
        Rc::new(Self {
            id,
            listener,
            serving: Cell::new(false),
            counter: Counter::new(),
            tasks: RefCell::new(Vec::new()),
            shutdown: Notify::new(),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn is_serving(&self) -> bool {
        self.serving.get()
    }

    /// Number of connections currently in flight on this worker.
    pub fn connections(&self) -> usize {
        self.counter.count()
    }

    /// Start the accept loop as a local task.
    pub fn spawn(self: &Rc<Self>, service: ConnectionService) -> JoinHandle<()> {
        let this = self.clone();
        tokio::task::spawn_local(async move { this.accept_loop(service).await })
    }

    async fn accept_loop(self: Rc<Self>, service: ConnectionService) {
        self.serving.set(true);
        info!("worker {} accepting connections", self.id);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.notified() => break,
                res = self.listener.accept() => match res {
                    Ok((stream, addr)) => self.handle_accept(&service, stream, addr),
                    Err(ref e) if connection_error(e) => continue,
                    Err(e) => {
                        // resource exhaustion (ENFILE/EMFILE and friends).
                        // back off instead of spinning on accept.
                        error!("worker {} accept error: {}", self.id, e);
                        sleep(Duration::from_secs(1)).await;
                    }
                },
            }
        }

        self.serving.set(false);
    }

    fn handle_accept(&self, service: &ConnectionService, stream: TcpStream, addr: SocketAddr) {
        self.reap_finished();

        let guard = self.counter.guard();
        let fut = service(stream, addr);
        let handle = tokio::task::spawn_local(async move {
            fut.await;
            drop(guard);
        });
        self.tasks.borrow_mut().push(handle);
    }

    fn reap_finished(&self) {
        self.tasks.borrow_mut().retain(|task| !task.is_finished());
    }

    /// Stop accepting, wait out in flight connections for `grace`, then
    /// cancel whatever is left.
    pub async fn stop(&self, grace: Duration) {
        self.shutdown.notify_one();

        let left = self.counter.wait_idle(grace).await;
        if left > 0 {
            info!("worker {} force stopped with {} connections left", self.id, left);
        }

        for task in self.tasks.borrow_mut().drain(..) {
            task.abort();
        }
    }
}

/// Errors that are scoped to a single failed connection. The next accept may
/// well succeed, so these never pause the loop.
fn connection_error(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::ConnectionRefused
        || e.kind() == io::ErrorKind::ConnectionAborted
        || e.kind() == io::ErrorKind::ConnectionReset
}

#[cfg(test)]
mod test {
    use super::*;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn accept_and_stop() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
                let addr = listener.local_addr().unwrap();
                let worker = Worker::new(0, Rc::new(listener));

                let service: ConnectionService = Rc::new(|mut stream, _| {
                    Box::pin(async move {
                        let mut buf = [0u8; 4];
                        let n = stream.read(&mut buf).await.unwrap();
                        stream.write_all(&buf[..n]).await.unwrap();
                    })
                });

                let handle = worker.spawn(service);
                assert_eq!(worker.id(), 0);

                let mut client = TcpStream::connect(addr).await.unwrap();
                client.write_all(b"ping").await.unwrap();
                let mut buf = [0u8; 4];
                client.read_exact(&mut buf).await.unwrap();
                assert_eq!(&buf, b"ping");

                worker.stop(Duration::from_millis(100)).await;
                handle.await.unwrap();
                assert!(!worker.is_serving());
                assert_eq!(worker.connections(), 0);
            })
            .await;
    }
}
