//! Byte-level collectives between ranks and the tensor reductions built on
//! them.
//!
//! Every rank must issue the same sequence of collective calls. A rank that
//! skips one leaves the others blocked forever; there are no timeouts.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, info};
use tch::{Device, Tensor};
use vqa_core::safetensors_util::{decode_tensors, encode_tensors};

use crate::error::{Result, TrainError};

pub trait Collective: Send {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Every rank contributes `payload` and receives all contributions in
    /// rank order.
    fn all_gather(&mut self, payload: Vec<u8>) -> Result<Vec<Vec<u8>>>;
}

#[derive(Debug)]
struct Shared {
    slots: Mutex<Vec<Vec<u8>>>,
    barrier: Barrier,
}

/// Ranks living as threads of one process.
#[derive(Debug, Clone)]
pub struct LocalGroup {
    rank: usize,
    world_size: usize,
    shared: Arc<Shared>,
}

impl LocalGroup {
    /// One handle per rank; hand each to its own thread.
    pub fn new(world_size: usize) -> Vec<LocalGroup> {
        let shared = Arc::new(Shared {
            slots: Mutex::new(vec![Vec::new(); world_size]),
            barrier: Barrier::new(world_size),
        });
        (0..world_size)
            .map(|rank| LocalGroup {
                rank,
                world_size,
                shared: Arc::clone(&shared),
            })
            .collect()
    }
}

impl Collective for LocalGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_gather(&mut self, payload: Vec<u8>) -> Result<Vec<Vec<u8>>> {
        {
            let mut slots = self
                .shared
                .slots
                .lock()
                .map_err(|_| TrainError::Collective("poisoned group state".to_string()))?;
            slots[self.rank] = payload;
        }
        self.shared.barrier.wait();
        let gathered = self
            .shared
            .slots
            .lock()
            .map_err(|_| TrainError::Collective("poisoned group state".to_string()))?
            .clone();
        // Nobody may overwrite a slot before every rank has read it.
        self.shared.barrier.wait();
        Ok(gathered)
    }
}

const CONNECT_ATTEMPTS: usize = 600;
const CONNECT_BACKOFF: Duration = Duration::from_millis(100);

fn write_frame(stream: &mut TcpStream, payload: &[u8]) -> Result<()> {
    stream.write_all(&(payload.len() as u64).to_le_bytes())?;
    stream.write_all(payload)?;
    Ok(())
}

fn read_frame(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let mut len = [0u8; 8];
    stream.read_exact(&mut len)?;
    let mut payload = vec![0u8; u64::from_le_bytes(len) as usize];
    stream.read_exact(&mut payload)?;
    Ok(payload)
}

/// Star topology over TCP: rank 0 listens on `master_addr`, collects every
/// contribution and sends the full set back to each worker. Frames are a
/// little-endian `u64` length followed by the bytes.
#[derive(Debug)]
pub struct TcpGroup {
    rank: usize,
    world_size: usize,
    /// Root: one stream per worker, index `r - 1`. Worker: the stream to root.
    peers: Vec<TcpStream>,
}

impl TcpGroup {
    pub fn connect(rank: usize, world_size: usize, master_addr: &str) -> Result<Self> {
        if world_size == 0 || rank >= world_size {
            return Err(TrainError::config(format!(
                "rank {} is outside world of size {}",
                rank, world_size
            )));
        }
        if world_size == 1 {
            return Ok(Self {
                rank,
                world_size,
                peers: Vec::new(),
            });
        }

        if rank == 0 {
            let listener = TcpListener::bind(master_addr)?;
            info!("waiting for {} workers on {}", world_size - 1, master_addr);
            let mut slots: Vec<Option<TcpStream>> = (1..world_size).map(|_| None).collect();
            for _ in 1..world_size {
                let (mut stream, addr) = listener.accept()?;
                stream.set_nodelay(true)?;
                let mut id = [0u8; 8];
                stream.read_exact(&mut id)?;
                let peer = u64::from_le_bytes(id) as usize;
                if peer == 0 || peer >= world_size || slots[peer - 1].is_some() {
                    return Err(TrainError::Collective(format!(
                        "unexpected rank {} from {}",
                        peer, addr
                    )));
                }
                debug!("rank {} connected from {}", peer, addr);
                slots[peer - 1] = Some(stream);
            }
            let peers = slots.into_iter().flatten().collect();
            Ok(Self {
                rank,
                world_size,
                peers,
            })
        } else {
            let mut stream = connect_with_retry(master_addr)?;
            stream.set_nodelay(true)?;
            stream.write_all(&(rank as u64).to_le_bytes())?;
            Ok(Self {
                rank,
                world_size,
                peers: vec![stream],
            })
        }
    }
}

fn connect_with_retry(addr: &str) -> Result<TcpStream> {
    let mut last = None;
    for _ in 0..CONNECT_ATTEMPTS {
        match TcpStream::connect(addr) {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                last = Some(e);
                thread::sleep(CONNECT_BACKOFF);
            }
        }
    }
    Err(TrainError::Collective(format!(
        "could not reach {}: {}",
        addr,
        last.map(|e| e.to_string()).unwrap_or_default()
    )))
}

impl Collective for TcpGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_gather(&mut self, payload: Vec<u8>) -> Result<Vec<Vec<u8>>> {
        if self.world_size == 1 {
            return Ok(vec![payload]);
        }
        if self.rank == 0 {
            let mut gathered = Vec::with_capacity(self.world_size);
            gathered.push(payload);
            for peer in &mut self.peers {
                gathered.push(read_frame(peer)?);
            }
            for peer in &mut self.peers {
                for frame in &gathered {
                    write_frame(peer, frame)?;
                }
            }
            Ok(gathered)
        } else {
            let root = &mut self.peers[0];
            write_frame(root, &payload)?;
            (0..self.world_size).map(|_| read_frame(root)).collect()
        }
    }
}

/// Replaces each tensor with its mean over all ranks. Tensors are matched by
/// name; every rank must pass the same names.
pub fn all_reduce_mean(group: &mut dyn Collective, named: &[(String, Tensor)]) -> Result<()> {
    let world = group.world_size();
    if world <= 1 || named.is_empty() {
        return Ok(());
    }
    let gathered = group.all_gather(encode_tensors(named)?)?;

    let mut sums: HashMap<String, Tensor> = HashMap::new();
    for blob in &gathered {
        for (name, tensor) in decode_tensors(blob, Device::Cpu)? {
            match sums.get_mut(&name) {
                Some(acc) => {
                    *acc += tensor;
                }
                None => {
                    sums.insert(name, tensor);
                }
            }
        }
    }

    tch::no_grad(|| -> Result<()> {
        for (name, target) in named {
            let total = sums.remove(name).ok_or_else(|| {
                TrainError::Collective(format!("tensor {} missing from reduction", name))
            })?;
            let mean = (total / world as f64)
                .to_kind(target.kind())
                .to_device(target.device());
            let mut target = target.shallow_clone();
            target.f_copy_(&mean)?;
        }
        Ok(())
    })
}

/// Overwrites each tensor with the value held by rank 0.
pub fn broadcast_from_root(group: &mut dyn Collective, named: &[(String, Tensor)]) -> Result<()> {
    if group.world_size() <= 1 {
        return Ok(());
    }
    let payload = if group.rank() == 0 {
        encode_tensors(named)?
    } else {
        Vec::new()
    };
    let gathered = group.all_gather(payload)?;
    if group.rank() == 0 {
        return Ok(());
    }

    let mut root = decode_tensors(&gathered[0], Device::Cpu)?;
    tch::no_grad(|| -> Result<()> {
        for (name, target) in named {
            let value = root.remove(name).ok_or_else(|| {
                TrainError::Collective(format!("tensor {} missing from broadcast", name))
            })?;
            let mut target = target.shallow_clone();
            target.f_copy_(&value.to_kind(target.kind()).to_device(target.device()))?;
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Kind;

    #[test]
    fn local_group_gathers_in_rank_order() {
        let handles: Vec<_> = LocalGroup::new(3)
            .into_iter()
            .map(|mut group| {
                thread::spawn(move || {
                    let rank = group.rank() as u8;
                    let first = group.all_gather(vec![rank]).unwrap();
                    let second = group.all_gather(vec![rank + 10]).unwrap();
                    (first, second)
                })
            })
            .collect();

        for handle in handles {
            let (first, second) = handle.join().unwrap();
            assert_eq!(first, vec![vec![0], vec![1], vec![2]]);
            assert_eq!(second, vec![vec![10], vec![11], vec![12]]);
        }
    }

    #[test]
    fn mean_and_broadcast_agree_across_threads() {
        let handles: Vec<_> = LocalGroup::new(2)
            .into_iter()
            .map(|mut group| {
                thread::spawn(move || {
                    let rank = group.rank() as f32;
                    let g = Tensor::from_slice(&[rank, 2.0 * rank]);
                    all_reduce_mean(&mut group, &[("g".to_string(), g.shallow_clone())]).unwrap();

                    let w = Tensor::full([2], rank as f64 + 1.0, (Kind::Float, Device::Cpu));
                    broadcast_from_root(&mut group, &[("w".to_string(), w.shallow_clone())]).unwrap();
                    (Vec::<f32>::try_from(&g).unwrap(), Vec::<f32>::try_from(&w).unwrap())
                })
            })
            .collect();

        for handle in handles {
            let (g, w) = handle.join().unwrap();
            assert_eq!(g, vec![0.5, 1.0]);
            assert_eq!(w, vec![1.0, 1.0]);
        }
    }

    #[test]
    fn tcp_group_round_trips_on_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let worker_addr = addr.clone();
        let worker = thread::spawn(move || {
            let mut group = TcpGroup::connect(1, 2, &worker_addr).unwrap();
            group.all_gather(b"one".to_vec()).unwrap()
        });
        let mut root = TcpGroup::connect(0, 2, &addr).unwrap();
        let gathered = root.all_gather(b"zero".to_vec()).unwrap();

        assert_eq!(gathered, vec![b"zero".to_vec(), b"one".to_vec()]);
        assert_eq!(worker.join().unwrap(), gathered);
    }
}
