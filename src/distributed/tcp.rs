/// Multi-process collective over TCP
///
/// Hub and spoke: rank 0 listens on the master address, every other rank
/// connects to it. A reduce sends each spoke's vector to the hub, which sums
/// contributions in rank order and sends the total back.
///
/// Wire format (little endian):
/// - handshake: `magic u32, rank u32, world u32`, answered by `magic u32, status u32`
/// - frame: `kind u32, round u64, count u64, count × f64`
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use super::Collective;
use crate::{EvalError, Result};

const MAGIC: u32 = 0x5345_564c;
const STATUS_OK: u32 = 0;
const STATUS_REJECTED: u32 = 1;

const FRAME_DATA: u32 = 1;
const FRAME_ABORT: u32 = 2;

/// Upper bound on values per frame, guards against garbage length prefixes
const MAX_FRAME_VALUES: u64 = 1 << 24;

enum Links {
    /// Rank 0: one stream per spoke, indexed by `rank - 1`
    Hub(Vec<TcpStream>),
    /// Rank > 0: stream to the hub
    Spoke(TcpStream),
}

struct State {
    links: Links,
    round: u64,
    failure: Option<String>,
}

/// One rank of a TCP collective group
pub struct TcpGroup {
    rank: usize,
    world_size: usize,
    state: Mutex<State>,
}

impl TcpGroup {
    /// Join a group, binding the master address on rank 0
    ///
    /// # Arguments
    /// * `rank` - This process's rank
    /// * `world_size` - Number of ranks
    /// * `master_addr` - Address of rank 0, e.g. `127.0.0.1:29500`
    /// * `timeout` - Limit for rendezvous and for each read/write
    pub fn connect(rank: usize, world_size: usize, master_addr: &str, timeout: Duration) -> Result<Self> {
        if world_size == 0 || rank >= world_size {
            return Err(EvalError::Configuration(format!(
                "invalid rank {} for world size {}",
                rank, world_size
            )));
        }
        let addr = resolve(master_addr)?;
        if rank == 0 {
            let listener = TcpListener::bind(addr).map_err(|e| {
                EvalError::Collective(format!("rank 0 cannot bind {}: {}", addr, e))
            })?;
            Self::hub(listener, world_size, timeout)
        } else {
            Self::spoke(rank, world_size, addr, timeout)
        }
    }

    /// Run rank 0 on an already bound listener
    pub fn hub(listener: TcpListener, world_size: usize, timeout: Duration) -> Result<Self> {
        let deadline = Instant::now() + timeout;
        listener.set_nonblocking(true).map_err(link_error("listener"))?;

        let mut slots: Vec<Option<TcpStream>> = (1..world_size).map(|_| None).collect();
        let mut joined = 0;
        while joined < world_size - 1 {
            let (mut stream, peer) = match listener.accept() {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(EvalError::Collective(format!(
                            "rendezvous timed out: {} of {} ranks joined",
                            joined + 1,
                            world_size
                        )));
                    }
                    thread::sleep(Duration::from_millis(10));
                    continue;
                }
                Err(e) => return Err(link_error("listener")(e)),
            };

            let (magic, peer_rank, peer_world) = match read_handshake(&mut stream, timeout) {
                Ok(hello) => hello,
                Err(e) => {
                    log::warn!("Dropped collective peer {} during handshake: {}", peer, describe_io(e));
                    continue;
                }
            };

            let valid = magic == MAGIC
                && peer_world == world_size
                && (1..world_size).contains(&peer_rank)
                && slots[peer_rank - 1].is_none();
            if !valid {
                log::warn!(
                    "Rejected collective peer {} (rank {}, world {})",
                    peer,
                    peer_rank,
                    peer_world
                );
                let _ = write_handshake_reply(&mut stream, STATUS_REJECTED);
                continue;
            }

            if let Err(e) = write_handshake_reply(&mut stream, STATUS_OK) {
                log::warn!("Dropped collective peer {} during handshake: {}", peer, describe_io(e));
                continue;
            }
            slots[peer_rank - 1] = Some(stream);
            joined += 1;
            log::debug!("Rank {} joined from {}", peer_rank, peer);
        }

        let streams = slots.into_iter().flatten().collect();
        log::info!("Collective group ready: {} ranks", world_size);
        Ok(Self {
            rank: 0,
            world_size,
            state: Mutex::new(State {
                links: Links::Hub(streams),
                round: 0,
                failure: None,
            }),
        })
    }

    fn spoke(rank: usize, world_size: usize, addr: SocketAddr, timeout: Duration) -> Result<Self> {
        let deadline = Instant::now() + timeout;
        // The hub may not be listening yet
        let mut stream = loop {
            match TcpStream::connect_timeout(&addr, Duration::from_secs(1)) {
                Ok(stream) => break stream,
                Err(e) if Instant::now() < deadline => {
                    log::debug!("Rank {} waiting for hub at {}: {}", rank, addr, e);
                    thread::sleep(Duration::from_millis(50));
                }
                Err(e) => {
                    return Err(EvalError::Collective(format!(
                        "rank {} could not reach hub at {}: {}",
                        rank, addr, e
                    )))
                }
            }
        };
        configure(&stream, timeout)?;

        let mut hello = Vec::with_capacity(12);
        hello.extend_from_slice(&MAGIC.to_le_bytes());
        hello.extend_from_slice(&(rank as u32).to_le_bytes());
        hello.extend_from_slice(&(world_size as u32).to_le_bytes());
        stream.write_all(&hello).map_err(link_error("handshake"))?;

        let magic = read_u32(&mut stream).map_err(link_error("handshake"))?;
        let status = read_u32(&mut stream).map_err(link_error("handshake"))?;
        if magic != MAGIC || status != STATUS_OK {
            return Err(EvalError::Collective(format!(
                "hub rejected rank {} (world size {})",
                rank, world_size
            )));
        }

        Ok(Self {
            rank,
            world_size,
            state: Mutex::new(State {
                links: Links::Spoke(stream),
                round: 0,
                failure: None,
            }),
        })
    }
}

impl Collective for TcpGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_reduce_sum(&self, values: &mut [f64]) -> Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| EvalError::Collective("collective state poisoned".to_string()))?;
        if let Some(reason) = &state.failure {
            return Err(EvalError::Collective(reason.clone()));
        }

        state.round += 1;
        let round = state.round;
        let outcome = match &mut state.links {
            Links::Hub(streams) => reduce_at_hub(streams, round, values),
            Links::Spoke(stream) => reduce_at_spoke(stream, round, values),
        };

        if let Err(reason) = outcome {
            state.failure = Some(reason.clone());
            return Err(EvalError::Collective(reason));
        }
        Ok(())
    }
}

fn reduce_at_hub(streams: &mut [TcpStream], round: u64, values: &mut [f64]) -> std::result::Result<(), String> {
    let mut sum = values.to_vec();
    let mut failure = None;
    for (i, stream) in streams.iter_mut().enumerate() {
        let rank = i + 1;
        match read_frame(stream, round) {
            Ok(contribution) if contribution.len() == values.len() => {
                for (acc, v) in sum.iter_mut().zip(&contribution) {
                    *acc += v;
                }
            }
            Ok(contribution) => {
                failure = Some(format!(
                    "rank {} contributed {} values, expected {}",
                    rank,
                    contribution.len(),
                    values.len()
                ));
                break;
            }
            Err(e) => {
                failure = Some(format!("rank {}: {}", rank, e));
                break;
            }
        }
    }
    if let Some(reason) = failure {
        abort_all(streams, round);
        return Err(reason);
    }

    for (i, stream) in streams.iter_mut().enumerate() {
        write_frame(stream, FRAME_DATA, round, &sum)
            .map_err(|e| format!("sending result to rank {}: {}", i + 1, e))?;
    }
    values.copy_from_slice(&sum);
    Ok(())
}

fn reduce_at_spoke(stream: &mut TcpStream, round: u64, values: &mut [f64]) -> std::result::Result<(), String> {
    write_frame(stream, FRAME_DATA, round, values).map_err(|e| format!("hub: {}", e))?;
    let sum = read_frame(stream, round).map_err(|e| format!("hub: {}", e))?;
    if sum.len() != values.len() {
        return Err(format!(
            "hub returned {} values, expected {}",
            sum.len(),
            values.len()
        ));
    }
    values.copy_from_slice(&sum);
    Ok(())
}

fn abort_all(streams: &mut [TcpStream], round: u64) {
    for stream in streams.iter_mut() {
        let _ = write_frame(stream, FRAME_ABORT, round, &[]);
    }
}

fn write_frame(stream: &mut TcpStream, kind: u32, round: u64, values: &[f64]) -> io::Result<()> {
    let mut buf = Vec::with_capacity(20 + values.len() * 8);
    buf.extend_from_slice(&kind.to_le_bytes());
    buf.extend_from_slice(&round.to_le_bytes());
    buf.extend_from_slice(&(values.len() as u64).to_le_bytes());
    for v in values {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    stream.write_all(&buf)?;
    stream.flush()
}

fn read_frame(stream: &mut TcpStream, expected_round: u64) -> std::result::Result<Vec<f64>, String> {
    let kind = read_u32(stream).map_err(describe_io)?;
    let round = read_u64(stream).map_err(describe_io)?;
    let count = read_u64(stream).map_err(describe_io)?;

    if kind == FRAME_ABORT {
        return Err(format!("group aborted in round {}", round));
    }
    if kind != FRAME_DATA {
        return Err(format!("unexpected frame kind {}", kind));
    }
    if round != expected_round {
        return Err(format!(
            "participant out of step: got round {}, expected {}",
            round, expected_round
        ));
    }
    if count > MAX_FRAME_VALUES {
        return Err(format!("frame too large: {} values", count));
    }

    let mut bytes = vec![0u8; count as usize * 8];
    stream.read_exact(&mut bytes).map_err(describe_io)?;
    Ok(bytes
        .chunks_exact(8)
        .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
        .collect())
}

fn write_handshake_reply(stream: &mut TcpStream, status: u32) -> io::Result<()> {
    let mut buf = [0u8; 8];
    buf[..4].copy_from_slice(&MAGIC.to_le_bytes());
    buf[4..].copy_from_slice(&status.to_le_bytes());
    stream.write_all(&buf)
}

fn read_u32(stream: &mut TcpStream) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(stream: &mut TcpStream) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    stream.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn configure(stream: &TcpStream, timeout: Duration) -> Result<()> {
    set_socket_options(stream, timeout).map_err(link_error("socket"))
}

fn set_socket_options(stream: &TcpStream, timeout: Duration) -> io::Result<()> {
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))
}

/// Read a joining peer's `(magic, rank, world)` greeting
fn read_handshake(stream: &mut TcpStream, timeout: Duration) -> io::Result<(u32, usize, usize)> {
    stream.set_nonblocking(false)?;
    set_socket_options(stream, timeout)?;
    let magic = read_u32(stream)?;
    let rank = read_u32(stream)? as usize;
    let world = read_u32(stream)? as usize;
    Ok((magic, rank, world))
}

fn describe_io(e: io::Error) -> String {
    match e.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => "timed out".to_string(),
        io::ErrorKind::UnexpectedEof => "connection closed".to_string(),
        _ => e.to_string(),
    }
}

fn link_error(what: &'static str) -> impl Fn(io::Error) -> EvalError {
    move |e| EvalError::Collective(format!("{}: {}", what, describe_io(e)))
}

fn resolve(addr: &str) -> Result<SocketAddr> {
    addr.to_socket_addrs()
        .map_err(|e| EvalError::Configuration(format!("invalid master address {}: {}", addr, e)))?
        .next()
        .ok_or_else(|| EvalError::Configuration(format!("master address {} did not resolve", addr)))
}
