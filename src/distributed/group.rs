use std::io::{self, BufReader, BufWriter};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use snafu::{ensure, ResultExt, Snafu};

use super::config::ProcessGroupConfig;
use super::frame::{read_frame, read_message, write_frame, write_message, Frame, FrameError};
use super::store::{accept_until, connect_until, register, remaining, RendezvousStore, StoreError};

#[derive(Debug, Snafu)]
pub enum ProcessGroupError {
    #[snafu(display("Cannot bind listener for the previous rank"))]
    Listen { source: io::Error },

    #[snafu(display("Rendezvous failed"))]
    Rendezvous { source: StoreError },

    #[snafu(display("Cannot connect to rank {rank} at {addr}"))]
    ConnectNext {
        source: io::Error,
        rank: usize,
        addr: SocketAddr,
    },

    #[snafu(display("Rank {rank} did not connect"))]
    AcceptPrev { source: io::Error, rank: usize },

    #[snafu(display("Cannot configure connection"))]
    Socket { source: io::Error },

    #[snafu(display("Handshake failed"))]
    Handshake { source: FrameError },

    #[snafu(display("Expected connection from rank {expected}, got rank {found}"))]
    WrongPeer { expected: usize, found: usize },

    #[snafu(display("Cannot send {frame} frame to rank {rank}"))]
    Send {
        source: FrameError,
        frame: String,
        rank: usize,
    },

    #[snafu(display("Cannot receive frame from rank {rank}"))]
    Receive { source: FrameError, rank: usize },

    #[snafu(display("Expected {expected} frame, got {found} frame"))]
    UnexpectedFrame { expected: String, found: String },

    #[snafu(display("Process group has no peers"))]
    NoPeers,
}

/// Group of processes that form a pipeline.
///
/// Ranks are connected in a ring: every rank sends frames to rank
/// `(rank + 1) % world_size` and receives frames from rank
/// `(rank + world_size - 1) % world_size`.
pub trait ProcessGroup: Send {
    /// Rank of this process.
    fn rank(&self) -> usize;

    /// Number of processes in the group.
    fn world_size(&self) -> usize;

    /// Send a frame to the next rank.
    fn send_next(&mut self, frame: &Frame) -> Result<(), ProcessGroupError>;

    /// Receive a frame from the previous rank.
    fn recv_prev(&mut self) -> Result<Frame, ProcessGroupError>;

    /// Wait until all ranks have reached the barrier.
    fn barrier(&mut self) -> Result<(), ProcessGroupError>;
}

/// Group consisting of only the current process.
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalGroup;

impl ProcessGroup for LocalGroup {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn send_next(&mut self, _frame: &Frame) -> Result<(), ProcessGroupError> {
        NoPeersSnafu.fail()
    }

    fn recv_prev(&mut self) -> Result<Frame, ProcessGroupError> {
        NoPeersSnafu.fail()
    }

    fn barrier(&mut self) -> Result<(), ProcessGroupError> {
        Ok(())
    }
}

#[derive(Debug, Deserialize, Serialize)]
struct Handshake {
    rank: usize,
}

/// Process group that communicates over TCP.
pub struct TcpGroup {
    rank: usize,
    world_size: usize,
    next: BufWriter<TcpStream>,
    prev: BufReader<TcpStream>,
}

impl TcpGroup {
    /// Join the process group.
    ///
    /// Rank 0 runs the rendezvous store. Every rank registers its listen
    /// address with the store, connects to the next rank and accepts the
    /// connection of the previous rank. Joining fails when the ring is not
    /// complete before the timeout.
    pub fn connect(config: &ProcessGroupConfig) -> Result<Self, ProcessGroupError> {
        let ProcessGroupConfig {
            rank, world_size, ..
        } = *config;
        let deadline = Instant::now() + config.timeout;

        let store = if rank == 0 {
            Some(
                RendezvousStore::start(config.master_port, world_size, config.timeout)
                    .context(RendezvousSnafu)?,
            )
        } else {
            None
        };

        let listener = TcpListener::bind("0.0.0.0:0").context(ListenSnafu)?;
        let listen_port = listener.local_addr().context(ListenSnafu)?.port();
        let addrs = register(&config.store_addr(), rank, listen_port, deadline)
            .context(RendezvousSnafu)?;
        if let Some(store) = store {
            store.join().context(RendezvousSnafu)?;
        }

        let next_rank = (rank + 1) % world_size;
        let prev_rank = (rank + world_size - 1) % world_size;

        let next_addr = addrs[next_rank];
        let next = connect_until(next_addr, deadline).context(ConnectNextSnafu {
            rank: next_rank,
            addr: next_addr,
        })?;
        next.set_nodelay(true).context(SocketSnafu)?;
        let mut next = BufWriter::new(next);
        write_message(&mut next, &Handshake { rank }).context(HandshakeSnafu)?;

        let prev = accept_until(&listener, deadline).context(AcceptPrevSnafu { rank: prev_rank })?;
        prev.set_read_timeout(Some(remaining(deadline)))
            .context(SocketSnafu)?;
        let mut prev = BufReader::new(prev);
        let handshake: Handshake = read_message(&mut prev).context(HandshakeSnafu)?;
        ensure!(
            handshake.rank == prev_rank,
            WrongPeerSnafu {
                expected: prev_rank,
                found: handshake.rank
            }
        );
        prev.get_ref()
            .set_read_timeout(Some(config.timeout))
            .context(SocketSnafu)?;

        log::info!("Rank {rank} connected to rank {next_rank} at {next_addr}");

        Ok(TcpGroup {
            rank,
            world_size,
            next,
            prev,
        })
    }

    fn expect(&mut self, expected: &Frame) -> Result<(), ProcessGroupError> {
        let frame = self.recv_prev()?;
        ensure!(
            frame.name() == expected.name(),
            UnexpectedFrameSnafu {
                expected: expected.name(),
                found: frame.name()
            }
        );
        Ok(())
    }
}

impl ProcessGroup for TcpGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn send_next(&mut self, frame: &Frame) -> Result<(), ProcessGroupError> {
        write_frame(&mut self.next, frame).context(SendSnafu {
            frame: frame.name(),
            rank: (self.rank + 1) % self.world_size,
        })
    }

    fn recv_prev(&mut self) -> Result<Frame, ProcessGroupError> {
        read_frame(&mut self.prev).context(ReceiveSnafu {
            rank: (self.rank + self.world_size - 1) % self.world_size,
        })
    }

    /// The barrier travels around the ring, starting at rank 0.
    fn barrier(&mut self) -> Result<(), ProcessGroupError> {
        if self.rank == 0 {
            self.send_next(&Frame::Barrier)?;
            self.expect(&Frame::Barrier)
        } else {
            self.expect(&Frame::Barrier)?;
            self.send_next(&Frame::Barrier)
        }
    }
}
