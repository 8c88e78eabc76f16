use std::collections::BTreeMap;
use std::io::{self, BufReader, BufWriter};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use snafu::{ensure, ResultExt, Snafu};

use super::frame::{read_message, write_message, FrameError};

const RETRY_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Snafu)]
pub enum StoreError {
    #[snafu(display("Cannot bind rendezvous store to {addr}"))]
    Bind { source: io::Error, addr: String },

    #[snafu(display("Cannot connect to rendezvous store at {addr}"))]
    ConnectStore { source: io::Error, addr: String },

    #[snafu(display("Rendezvous store did not receive all registrations"))]
    AcceptRegistration { source: io::Error },

    #[snafu(display("Cannot configure rendezvous connection"))]
    Socket { source: io::Error },

    #[snafu(display("Cannot exchange rendezvous message"))]
    Exchange { source: FrameError },

    #[snafu(display("Rank {rank} registered with world size {world_size}"))]
    InvalidRank { rank: usize, world_size: usize },

    #[snafu(display("Rank {rank} registered twice"))]
    DuplicateRank { rank: usize },

    #[snafu(display("Rendezvous store sent an unexpected message"))]
    UnexpectedMessage,

    #[snafu(display("Rendezvous store sent an invalid address: {addr}"))]
    InvalidAddress {
        source: std::net::AddrParseError,
        addr: String,
    },

    #[snafu(display("Rendezvous store thread panicked"))]
    StorePanicked,
}

#[derive(Debug, Deserialize, Serialize)]
enum StoreMessage {
    Register { rank: usize, addr: String },
    Table { addrs: Vec<String> },
}

/// Rendezvous store.
///
/// The store collects the listen addresses of all ranks. Once every rank
/// has registered, the full address table is sent to all ranks.
pub struct RendezvousStore {
    handle: JoinHandle<Result<(), StoreError>>,
}

impl RendezvousStore {
    /// Start the store in a background thread.
    pub fn start(port: u16, world_size: usize, timeout: Duration) -> Result<Self, StoreError> {
        let addr = format!("0.0.0.0:{port}");
        let listener = TcpListener::bind(&addr).context(BindSnafu { addr })?;
        let handle = thread::spawn(move || serve(listener, world_size, timeout));
        Ok(RendezvousStore { handle })
    }

    /// Wait until the store has sent the address table to all ranks.
    pub fn join(self) -> Result<(), StoreError> {
        self.handle.join().map_err(|_| StoreError::StorePanicked)?
    }
}

fn serve(listener: TcpListener, world_size: usize, timeout: Duration) -> Result<(), StoreError> {
    let deadline = Instant::now() + timeout;
    let mut registrations: BTreeMap<usize, (String, TcpStream)> = BTreeMap::new();

    while registrations.len() < world_size {
        let stream = accept_until(&listener, deadline).context(AcceptRegistrationSnafu)?;
        stream
            .set_read_timeout(Some(timeout))
            .context(SocketSnafu)?;
        let message = read_message(&mut BufReader::new(&stream)).context(ExchangeSnafu)?;
        let (rank, addr) = match message {
            StoreMessage::Register { rank, addr } => (rank, addr),
            StoreMessage::Table { .. } => return UnexpectedMessageSnafu.fail(),
        };
        ensure!(rank < world_size, InvalidRankSnafu { rank, world_size });
        ensure!(
            !registrations.contains_key(&rank),
            DuplicateRankSnafu { rank }
        );

        log::debug!("Rank {rank} registered with listen address {addr}");
        registrations.insert(rank, (addr, stream));
    }

    let table = StoreMessage::Table {
        addrs: registrations
            .values()
            .map(|(addr, _)| addr.clone())
            .collect(),
    };
    for (_, stream) in registrations.values() {
        write_message(&mut BufWriter::new(stream), &table).context(ExchangeSnafu)?;
    }

    Ok(())
}

/// Register the listen port of `rank` and wait for the address table.
///
/// The advertised IP address is the local address of the connection to
/// the store, which is an address that other nodes can reach this node on.
pub fn register(
    store_addr: &str,
    rank: usize,
    listen_port: u16,
    deadline: Instant,
) -> Result<Vec<SocketAddr>, StoreError> {
    let stream = connect_until(store_addr, deadline).context(ConnectStoreSnafu {
        addr: store_addr,
    })?;
    let local_ip = stream.local_addr().context(SocketSnafu)?.ip();
    let addr = SocketAddr::new(local_ip, listen_port);

    write_message(
        &mut BufWriter::new(&stream),
        &StoreMessage::Register {
            rank,
            addr: addr.to_string(),
        },
    )
    .context(ExchangeSnafu)?;

    stream
        .set_read_timeout(Some(remaining(deadline)))
        .context(SocketSnafu)?;
    match read_message(&mut BufReader::new(&stream)).context(ExchangeSnafu)? {
        StoreMessage::Table { addrs } => addrs
            .into_iter()
            .map(|addr| addr.parse().context(InvalidAddressSnafu { addr }))
            .collect(),
        StoreMessage::Register { .. } => UnexpectedMessageSnafu.fail(),
    }
}

/// Connect to `addr`, retrying until the deadline has passed.
pub(crate) fn connect_until(addr: impl ToSocketAddrs, deadline: Instant) -> io::Result<TcpStream> {
    loop {
        match TcpStream::connect(&addr) {
            Ok(stream) => return Ok(stream),
            Err(err) if Instant::now() >= deadline => return Err(err),
            Err(_) => thread::sleep(RETRY_INTERVAL),
        }
    }
}

/// Accept a connection, waiting until the deadline has passed.
pub(crate) fn accept_until(listener: &TcpListener, deadline: Instant) -> io::Result<TcpStream> {
    listener.set_nonblocking(true)?;
    loop {
        match listener.accept() {
            Ok((stream, _)) => {
                stream.set_nonblocking(false)?;
                return Ok(stream);
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "timed out waiting for connection",
                    ));
                }
                thread::sleep(RETRY_INTERVAL);
            }
            Err(err) => return Err(err),
        }
    }
}

/// Time until the deadline, at least one millisecond.
///
/// A zero read timeout is rejected by the standard library.
pub(crate) fn remaining(deadline: Instant) -> Duration {
    deadline
        .saturating_duration_since(Instant::now())
        .max(Duration::from_millis(1))
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::thread;
    use std::time::{Duration, Instant};

    use super::{register, RendezvousStore};

    fn free_port() -> u16 {
        TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[test]
    fn all_ranks_receive_the_address_table() {
        let port = free_port();
        let store = RendezvousStore::start(port, 3, Duration::from_secs(10)).unwrap();
        let store_addr = format!("127.0.0.1:{port}");
        let deadline = Instant::now() + Duration::from_secs(10);

        let handles: Vec<_> = (0..3)
            .map(|rank| {
                let store_addr = store_addr.clone();
                thread::spawn(move || register(&store_addr, rank, 4000 + rank as u16, deadline))
            })
            .collect();
        let tables: Vec<_> = handles
            .into_iter()
            .map(|handle| handle.join().unwrap().unwrap())
            .collect();
        store.join().unwrap();

        for table in tables {
            let ports: Vec<u16> = table.iter().map(|addr| addr.port()).collect();
            assert_eq!(ports, vec![4000, 4001, 4002]);
            assert!(table.iter().all(|addr| addr.ip().is_loopback()));
        }
    }
}
