//! Mock seeder for integration tests
//!
//! Listens on `127.0.0.1:0` and serves one torrent's content to every
//! connection: handshake, optional BEP 10/BEP 9 metadata, a full bitfield,
//! unchoke on `interested`, then `piece` replies to requests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use torrent_engine::protocol::{read_handshake, read_message, write_handshake, write_message};
use torrent_engine::torrent::bencode::Value;
use torrent_engine::torrent::info::sha1_digest;
use torrent_engine::{
    Bitfield, EngineConfig, EngineEvent, EventStream, ExtendedHandshake, Handshake, Message, MetadataMessage,
};

/// `ut_metadata` id the mock asks to be addressed with
const MOCK_UT_METADATA: u8 = 3;
const METADATA_PIECE: usize = 16 * 1024;

/// A torrent built in memory with real piece digests
#[derive(Clone)]
pub struct TestTorrent {
    pub name: String,
    pub content: Vec<u8>,
    pub piece_length: usize,
    pub info_bytes: Vec<u8>,
    pub info_hash: [u8; 20],
}

impl TestTorrent {
    pub fn single(name: &str, content: Vec<u8>, piece_length: usize) -> Self {
        let pieces: Vec<u8> = content
            .chunks(piece_length)
            .flat_map(|chunk| sha1_digest(chunk))
            .collect();
        let info_bytes = Value::dict([
            (b"length".as_ref(), Value::Int(content.len() as i64)),
            (b"name".as_ref(), Value::bytes(name)),
            (b"piece length".as_ref(), Value::Int(piece_length as i64)),
            (b"pieces".as_ref(), Value::Bytes(pieces)),
        ])
        .encode();
        let info_hash = sha1_digest(&info_bytes);
        Self {
            name: name.to_string(),
            content,
            piece_length,
            info_bytes,
            info_hash,
        }
    }

    /// Deterministic pseudo-random content of `len` bytes
    pub fn patterned(name: &str, len: usize, piece_length: usize) -> Self {
        let content = (0..len).map(|i| ((i * 31 + i / 7) % 251) as u8).collect();
        Self::single(name, content, piece_length)
    }

    pub fn piece_count(&self) -> usize {
        self.content.len().div_ceil(self.piece_length)
    }

    /// Metainfo bytes (a `.torrent` file) for this content
    pub fn metainfo(&self) -> Vec<u8> {
        let mut out = b"d4:info".to_vec();
        out.extend_from_slice(&self.info_bytes);
        out.push(b'e');
        out
    }

    pub fn magnet(&self) -> String {
        format!("magnet:?xt=urn:btih:{}&dn={}", hex::encode(self.info_hash), self.name)
    }
}

/// Seeder behaviour switches
#[derive(Clone, Default)]
pub struct SeederOptions {
    /// Answer with a different info-hash
    pub wrong_info_hash: bool,
    /// Serve the first block of piece 0 with flipped bytes, once
    pub corrupt_first_piece: bool,
    /// Advertise BEP 10 and serve metadata over `ut_metadata`
    pub serve_metadata: bool,
    /// Ask the client for a metadata piece far past the end of the info dict
    pub oversized_metadata_request: bool,
    /// Never answer the first request for piece 0, offset 0
    pub stall_first_block: bool,
    /// Stay choked and push this many blocks of the last piece nobody asked for
    pub unsolicited_blocks: usize,
    /// Pause before each block reply
    pub block_delay: Duration,
}

#[derive(Default)]
struct Counters {
    connections: AtomicUsize,
    requests: AtomicUsize,
    metadata_rejects: AtomicUsize,
    corrupted: AtomicBool,
    stalled: AtomicBool,
}

pub struct MockSeeder {
    addr: SocketAddr,
    counters: Arc<Counters>,
    task: JoinHandle<()>,
}

impl MockSeeder {
    pub async fn start(torrent: TestTorrent, options: SeederOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let counters = Arc::new(Counters::default());
        let shared = Arc::new(torrent);

        let task = {
            let counters = Arc::clone(&counters);
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    counters.connections.fetch_add(1, Ordering::SeqCst);
                    let torrent = Arc::clone(&shared);
                    let counters = Arc::clone(&counters);
                    let options = options.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve(stream, &torrent, &options, &counters).await {
                            tracing::debug!("Mock seeder connection ended: {}", e);
                        }
                    });
                }
            })
        };

        Self { addr, counters, task }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn connections(&self) -> usize {
        self.counters.connections.load(Ordering::SeqCst)
    }

    /// Block requests received over all connections
    pub fn requests(&self) -> usize {
        self.counters.requests.load(Ordering::SeqCst)
    }

    /// `ut_metadata` rejects received from the client
    pub fn metadata_rejects(&self) -> usize {
        self.counters.metadata_rejects.load(Ordering::SeqCst)
    }
}

impl Drop for MockSeeder {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(
    mut stream: TcpStream,
    torrent: &TestTorrent,
    options: &SeederOptions,
    counters: &Counters,
) -> anyhow::Result<()> {
    let theirs = read_handshake(&mut stream).await?;
    let info_hash = if options.wrong_info_hash {
        [0xEE; 20]
    } else {
        torrent.info_hash
    };
    let mut peer_id = *b"-MO0001-000000000000";
    peer_id[8..].copy_from_slice(&rand::random::<[u8; 12]>());
    let ours = if options.serve_metadata {
        Handshake::new(info_hash, peer_id)
    } else {
        Handshake::plain(info_hash, peer_id)
    };
    write_handshake(&mut stream, &ours).await?;
    if options.wrong_info_hash {
        // let the other side notice before hanging up
        tokio::time::sleep(Duration::from_millis(200)).await;
        return Ok(());
    }

    let extended = options.serve_metadata && theirs.supports_extensions();
    if extended {
        let handshake = ExtendedHandshake {
            ut_metadata: Some(MOCK_UT_METADATA),
            metadata_size: Some(torrent.info_bytes.len()),
            client: Some("mock seeder".to_string()),
        };
        write_message(
            &mut stream,
            &Message::Extended {
                id: 0,
                payload: handshake.encode(),
            },
        )
        .await?;
    }

    let mut have = Bitfield::new(torrent.piece_count());
    for i in 0..torrent.piece_count() {
        have.set(i);
    }
    write_message(&mut stream, &Message::Bitfield { bitfield: have.to_bytes() }).await?;

    if options.unsolicited_blocks > 0 {
        let index = torrent.piece_count() - 1;
        let start = index * torrent.piece_length;
        let end = (start + 16384).min(torrent.content.len());
        for _ in 0..options.unsolicited_blocks {
            write_message(
                &mut stream,
                &Message::Piece {
                    index: index as u32,
                    begin: 0,
                    block: Bytes::copy_from_slice(&torrent.content[start..end]),
                },
            )
            .await?;
        }
    }

    let mut their_ut_metadata = None;
    loop {
        match read_message(&mut stream).await? {
            Message::Interested if options.unsolicited_blocks == 0 => {
                write_message(&mut stream, &Message::Unchoke).await?
            }
            Message::Request { index, begin, length } => {
                counters.requests.fetch_add(1, Ordering::SeqCst);
                if options.stall_first_block
                    && index == 0
                    && begin == 0
                    && !counters.stalled.swap(true, Ordering::SeqCst)
                {
                    continue;
                }
                if !options.block_delay.is_zero() {
                    tokio::time::sleep(options.block_delay).await;
                }
                let start = index as usize * torrent.piece_length + begin as usize;
                let end = (start + length as usize).min(torrent.content.len());
                let mut block = torrent.content[start..end].to_vec();
                if options.corrupt_first_piece
                    && index == 0
                    && begin == 0
                    && !counters.corrupted.swap(true, Ordering::SeqCst)
                {
                    block.iter_mut().for_each(|b| *b = !*b);
                }
                write_message(
                    &mut stream,
                    &Message::Piece {
                        index,
                        begin,
                        block: Bytes::from(block),
                    },
                )
                .await?;
            }
            Message::Extended { id: 0, payload } => {
                their_ut_metadata = ExtendedHandshake::decode(&payload)?.ut_metadata;
                if let (true, true, Some(id)) = (extended, options.oversized_metadata_request, their_ut_metadata) {
                    let request = MetadataMessage::Request { piece: 1 << 60 };
                    write_message(
                        &mut stream,
                        &Message::Extended {
                            id,
                            payload: request.encode(),
                        },
                    )
                    .await?;
                }
            }
            Message::Extended {
                id: MOCK_UT_METADATA,
                payload,
            } if extended => {
                let piece = match MetadataMessage::decode(&payload)? {
                    MetadataMessage::Request { piece } => piece,
                    MetadataMessage::Reject { .. } => {
                        counters.metadata_rejects.fetch_add(1, Ordering::SeqCst);
                        continue;
                    }
                    MetadataMessage::Data { .. } => continue,
                };
                let Some(reply_id) = their_ut_metadata else {
                    continue;
                };
                let start = piece * METADATA_PIECE;
                let end = (start + METADATA_PIECE).min(torrent.info_bytes.len());
                let reply = MetadataMessage::Data {
                    piece,
                    total_size: torrent.info_bytes.len(),
                    data: Bytes::copy_from_slice(&torrent.info_bytes[start..end]),
                };
                write_message(
                    &mut stream,
                    &Message::Extended {
                        id: reply_id,
                        payload: reply.encode(),
                    },
                )
                .await?;
            }
            _ => {}
        }
    }
}

/// Config that talks only to the given peers
pub fn local_config(peers: Vec<SocketAddr>) -> EngineConfig {
    EngineConfig {
        use_trackers: false,
        dht_bootstrap_timeout: None,
        ephemeral: true,
        manual_peers: peers,
        request_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

/// Collect whatever arrives within `window`
pub async fn events_for(events: &mut EventStream, window: Duration) -> Vec<EngineEvent> {
    let mut seen = Vec::new();
    let _ = tokio::time::timeout(window, async {
        while let Some(event) = events.recv().await {
            seen.push(event);
        }
    })
    .await;
    seen
}

/// Collect events until `stop` matches, failing after `limit`
pub async fn events_until(
    events: &mut EventStream,
    limit: Duration,
    stop: impl Fn(&EngineEvent) -> bool,
) -> Vec<EngineEvent> {
    let mut seen = Vec::new();
    let result = tokio::time::timeout(limit, async {
        while let Some(event) = events.recv().await {
            let done = stop(&event);
            seen.push(event);
            if done {
                return;
            }
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for event, saw {:?}", seen);
    seen
}
