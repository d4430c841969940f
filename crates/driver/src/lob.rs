//! LOB streaming engine.
//!
//! Two transfer directions share the 1 KiB block framing:
//!
//! - **Write** (client -> server): the caller feeds a [`LobWriter`], whose
//!   bytes travel through an in-process pipe to a background task that
//!   frames them into [`proto::LobDataBlock`]s on the outbound stream. The
//!   server answers with a stream of references; the first one gates
//!   production of further frames, the final one is the durable handle
//!   returned by [`LobWriter::finish`].
//! - **Read** (server -> client): a [`LobReader`] pulls 2-block windows
//!   on demand and exposes the payload bytes as a finite, non-restartable
//!   byte source.
//!
//! The database family drives framing quirks: every family but H2 opens
//! the stream with an empty start frame carrying the metadata blob, while
//! H2 (which rejects partial streams) sends the entire payload in a single
//! frame.

use ojp_proto::{MAX_LOB_BLOCK_SIZE, proto};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::channel::{ChannelHandle, ServiceClient, check_outbound_size};
use crate::error::{DriverError, LobWritePhase, Result};
use crate::session::Session;

/// Bytes fetched per read request: two wire blocks.
const READ_WINDOW: usize = 2 * MAX_LOB_BLOCK_SIZE;

/// Capacity of the in-process pipe between the caller and the framer.
const PIPE_CAPACITY: usize = 8 * 1024;

/// Depth of the outbound frame queue feeding the RPC stream.
const FRAME_QUEUE_DEPTH: usize = 8;

/// Options for a LOB write.
#[derive(Debug, Clone)]
pub struct LobWriteOptions {
    /// 1-based position the payload starts at within the target object.
    pub base_position: u64,
    /// Declared total length; frames are trimmed so the transferred byte
    /// count never exceeds it.
    pub declared_length: Option<u64>,
    /// Opaque metadata blob carried on every frame (encode with
    /// [`codec::encode`](crate::codec::encode)).
    pub metadata: Vec<u8>,
}

impl Default for LobWriteOptions {
    fn default() -> Self {
        Self { base_position: 1, declared_length: None, metadata: Vec::new() }
    }
}

/// Framing parameters shared by every frame of one upload.
pub(crate) struct FrameSettings {
    pub(crate) session: Session,
    pub(crate) kind: proto::LobKind,
    pub(crate) family: proto::DbFamily,
    pub(crate) base_position: u64,
    pub(crate) declared_length: Option<u64>,
    pub(crate) metadata: Vec<u8>,
    pub(crate) max_outbound: usize,
}

impl FrameSettings {
    fn frame(&self, position: i64, payload: Vec<u8>) -> proto::LobDataBlock {
        proto::LobDataBlock {
            kind: self.kind as i32,
            session: Some(self.session.snapshot()),
            position,
            payload,
            metadata: self.metadata.clone(),
        }
    }
}

/// Reads one byte to detect end-of-stream cheaply between frames.
async fn read_one<R: AsyncRead + Unpin>(
    reader: &mut R,
    token: &CancellationToken,
) -> Result<Option<u8>> {
    let mut byte = [0u8; 1];
    let read = tokio::select! {
        biased;
        () = token.cancelled() => return Err(DriverError::Cancelled),
        result = reader.read(&mut byte) => result.map_err(|e| DriverError::Protocol {
            message: format!("LOB pipe read failed: {e}"),
        })?,
    };
    Ok(if read == 0 { None } else { Some(byte[0]) })
}

/// Fills the payload up to one block, stopping early at end-of-stream.
async fn fill_block<R: AsyncRead + Unpin>(
    reader: &mut R,
    payload: &mut Vec<u8>,
    token: &CancellationToken,
) -> Result<()> {
    let mut chunk = [0u8; MAX_LOB_BLOCK_SIZE];
    while payload.len() < MAX_LOB_BLOCK_SIZE {
        let want = MAX_LOB_BLOCK_SIZE - payload.len();
        let read = tokio::select! {
            biased;
            () = token.cancelled() => return Err(DriverError::Cancelled),
            result = reader.read(&mut chunk[..want]) => result.map_err(|e| DriverError::Protocol {
                message: format!("LOB pipe read failed: {e}"),
            })?,
        };
        if read == 0 {
            break;
        }
        payload.extend_from_slice(&chunk[..read]);
    }
    Ok(())
}

/// Drains the remainder of the pipe into the payload (H2 bulk transfer).
async fn read_rest<R: AsyncRead + Unpin>(
    reader: &mut R,
    payload: &mut Vec<u8>,
    token: &CancellationToken,
) -> Result<()> {
    tokio::select! {
        biased;
        () = token.cancelled() => Err(DriverError::Cancelled),
        result = reader.read_to_end(payload) => {
            result.map_err(|e| DriverError::Protocol {
                message: format!("LOB pipe read failed: {e}"),
            })?;
            Ok(())
        },
    }
}

/// Emits one frame onto the outbound queue, enforcing the size guard.
async fn send_block(
    tx: &mpsc::Sender<proto::LobDataBlock>,
    block: proto::LobDataBlock,
    limit: usize,
    token: &CancellationToken,
) -> Result<()> {
    check_outbound_size(&block, limit)?;
    tokio::select! {
        biased;
        () = token.cancelled() => Err(DriverError::Cancelled),
        result = tx.send(block) => result.map_err(|_| DriverError::Protocol {
            message: "LOB stream closed before all blocks were sent".to_owned(),
        }),
    }
}

/// Awaits the server's first reference before producing further frames.
/// One-shot; later invocations are no-ops.
async fn await_first(
    first_ref: &mut Option<oneshot::Receiver<Result<proto::LobReference>>>,
    token: &CancellationToken,
) -> Result<()> {
    let Some(rx) = first_ref.take() else {
        return Ok(());
    };
    let outcome = tokio::select! {
        biased;
        () = token.cancelled() => return Err(DriverError::Cancelled),
        outcome = rx => outcome,
    };
    match outcome {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(error)) => Err(error),
        Err(_) => Err(DriverError::Protocol {
            message: "LOB acknowledgement channel closed".to_owned(),
        }),
    }
}

/// Background producer: frames pipe bytes into blocks on the outbound
/// queue until the pipe reaches end-of-stream.
///
/// Framing rules:
/// 1. Non-H2 families open with an empty start frame at position 1
///    carrying the metadata blob. H2 skips it; its first and only data
///    frame carries the entire remaining payload (an empty H2 stream
///    emits no frames at all).
/// 2. Data frame positions advance by one block per frame regardless of
///    the payload size actually read: position =
///    blocks-counted + base-position - block-size.
/// 3. When a declared length is set, frames are trimmed so the cumulative
///    byte count equals it exactly.
pub(crate) async fn pump_frames<R: AsyncRead + Unpin>(
    settings: FrameSettings,
    mut reader: R,
    tx: mpsc::Sender<proto::LobDataBlock>,
    first_ref: oneshot::Receiver<Result<proto::LobReference>>,
    token: CancellationToken,
) -> Result<()> {
    let h2 = settings.family == proto::DbFamily::H2;
    let mut first_ref = Some(first_ref);
    let block = MAX_LOB_BLOCK_SIZE as u64;
    let mut counted: u64 = 0;

    if !h2 {
        send_block(&tx, settings.frame(1, Vec::new()), settings.max_outbound, &token).await?;
        await_first(&mut first_ref, &token).await?;
    }

    while let Some(first_byte) = read_one(&mut reader, &token).await? {
        let mut payload = vec![first_byte];
        if h2 {
            read_rest(&mut reader, &mut payload, &token).await?;
        } else {
            fill_block(&mut reader, &mut payload, &token).await?;
        }

        counted += block;
        let position = counted + settings.base_position - block;

        if let Some(declared) = settings.declared_length {
            let sent_through = position + payload.len() as u64 - 1;
            if sent_through > declared {
                let excess = (sent_through - declared) as usize;
                payload.truncate(payload.len().saturating_sub(excess));
            }
        }

        tracing::debug!(position, len = payload.len(), "sending LOB data block");
        send_block(&tx, settings.frame(position as i64, payload), settings.max_outbound, &token)
            .await?;
        await_first(&mut first_ref, &token).await?;

        if h2 {
            break;
        }
    }

    Ok(())
}

/// Consumes the server's reference stream, resolving the first- and
/// final-reference slots and adopting replacement sessions as they
/// arrive. A transport error resolves both slots exceptionally.
pub(crate) async fn drive_references(
    mut stream: tonic::Streaming<proto::LobReference>,
    session: Session,
    first_tx: oneshot::Sender<Result<proto::LobReference>>,
    final_tx: oneshot::Sender<Result<proto::LobReference>>,
) {
    let mut first_tx = Some(first_tx);
    let mut last: Option<proto::LobReference> = None;

    loop {
        match stream.message().await {
            Ok(Some(reference)) => {
                if let Some(info) = reference.session.clone() {
                    session.merge(info);
                }
                if let Some(tx) = first_tx.take() {
                    let _ = tx.send(Ok(reference.clone()));
                }
                last = Some(reference);
            },
            Ok(None) => {
                let outcome = last.take().ok_or(DriverError::LobReferenceMissing);
                let _ = final_tx.send(outcome);
                return;
            },
            Err(status) => {
                tracing::warn!(%status, "LOB reference stream failed");
                if let Some(tx) = first_tx.take() {
                    let _ = tx.send(Err(DriverError::from(status.clone())));
                }
                let _ = final_tx.send(Err(DriverError::from(status)));
                return;
            },
        }
    }
}

/// Byte sink for an in-flight LOB upload.
///
/// Bytes written are produced into an internal pipe and consumed by a
/// background task that frames them onto the outbound stream. Dropping
/// the writer without calling [`finish`](Self::finish) aborts the upload.
pub struct LobWriter {
    pipe: Option<DuplexStream>,
    framer: Option<tokio::task::JoinHandle<Result<()>>>,
    final_rx: Option<oneshot::Receiver<Result<proto::LobReference>>>,
    session: Session,
    token: CancellationToken,
}

impl LobWriter {
    /// Opens the upload stream against the endpoint owning the session
    /// and spawns the framing and reference-driving tasks.
    pub(crate) async fn start(
        handle: &ChannelHandle,
        session: Session,
        kind: proto::LobKind,
        options: LobWriteOptions,
        max_outbound: usize,
        token: CancellationToken,
    ) -> Result<Self> {
        let (pipe_writer, pipe_reader) = tokio::io::duplex(PIPE_CAPACITY);
        let (block_tx, block_rx) = mpsc::channel(FRAME_QUEUE_DEPTH);
        let (first_tx, first_rx) = oneshot::channel();
        let (final_tx, final_rx) = oneshot::channel();

        let settings = FrameSettings {
            session: session.clone(),
            kind,
            family: session.db_family(),
            base_position: options.base_position,
            declared_length: options.declared_length,
            metadata: options.metadata,
            max_outbound,
        };
        let framer = tokio::spawn(pump_frames(settings, pipe_reader, block_tx, first_rx, token.clone()));

        let mut client = handle.streaming();
        let response = tokio::select! {
            biased;
            () = token.cancelled() => {
                framer.abort();
                return Err(DriverError::Cancelled);
            },
            response = client.create_lob(ReceiverStream::new(block_rx)) => response,
        };
        let stream = match response {
            Ok(response) => response.into_inner(),
            Err(status) => {
                framer.abort();
                return Err(DriverError::from(status));
            },
        };

        tokio::spawn(drive_references(stream, session.clone(), first_tx, final_tx));

        Ok(Self {
            pipe: Some(pipe_writer),
            framer: Some(framer),
            final_rx: Some(final_rx),
            session,
            token,
        })
    }

    /// Writes payload bytes into the upload pipe.
    ///
    /// # Errors
    ///
    /// Fails with [`DriverError::Cancelled`] on shutdown, or a send-phase
    /// error when the background task has already failed.
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        let Some(pipe) = self.pipe.as_mut() else {
            return Err(DriverError::Protocol { message: "LOB writer already closed".to_owned() });
        };
        tokio::select! {
            biased;
            () = self.token.cancelled() => Err(DriverError::Cancelled),
            result = pipe.write_all(data) => result.map_err(|e| {
                DriverError::Protocol { message: format!("LOB pipe closed: {e}") }
                    .in_write_phase(LobWritePhase::Send)
            }),
        }
    }

    /// Closes the sink: ends the pipe, joins the background task, awaits
    /// the final reference, validates it, and adopts its session.
    ///
    /// # Errors
    ///
    /// Reports the failing phase: send (framing/transport), validate
    /// ([`DriverError::LobReferenceMissing`] for a missing identifier), or
    /// refresh-session.
    pub async fn finish(mut self) -> Result<proto::LobReference> {
        if let Some(mut pipe) = self.pipe.take() {
            let _ = pipe.shutdown().await;
        }

        if let Some(framer) = self.framer.take() {
            match framer.await {
                Ok(Ok(())) => {},
                Ok(Err(error)) => return Err(error.in_write_phase(LobWritePhase::Send)),
                Err(join_error) => {
                    return Err(DriverError::Protocol {
                        message: format!("LOB framing task failed: {join_error}"),
                    }
                    .in_write_phase(LobWritePhase::Send));
                },
            }
        }

        let Some(final_rx) = self.final_rx.take() else {
            return Err(DriverError::LobReferenceMissing);
        };
        let reference = tokio::select! {
            biased;
            () = self.token.cancelled() => return Err(DriverError::Cancelled),
            outcome = final_rx => match outcome {
                Ok(Ok(reference)) => reference,
                Ok(Err(error)) => return Err(error.in_write_phase(LobWritePhase::Send)),
                Err(_) => return Err(DriverError::LobReferenceMissing),
            },
        };

        if reference.identifier.is_empty() {
            return Err(DriverError::LobReferenceMissing);
        }

        match reference.session.clone() {
            Some(info) => self.session.merge(info),
            None => {
                return Err(DriverError::Protocol {
                    message: "final LOB reference carried no session".to_owned(),
                }
                .in_write_phase(LobWritePhase::RefreshSession));
            },
        }

        Ok(reference)
    }
}

impl Drop for LobWriter {
    fn drop(&mut self) {
        // An unfinished upload must not commit a partial LOB.
        if let Some(framer) = &self.framer {
            framer.abort();
        }
    }
}

/// Finite, non-restartable byte source over a stored LOB.
///
/// Maintains a 1-based cursor; when the in-hand block window is exhausted
/// the reader requests the next 2-block window starting at cursor + 1,
/// unless the exhaustion position proves the previous window was the last
/// one (a window ending off the 2-block boundary cannot be followed by
/// more data, while one ending exactly on the boundary requires another
/// fetch to find out).
pub struct LobReader {
    client: ServiceClient,
    reference: proto::LobReference,
    /// Last absolute position returned; starts at `position - 1`.
    cursor: u64,
    /// Absolute position after which no more bytes are wanted.
    limit: u64,
    window: Option<WindowStream>,
    finished: bool,
    max_outbound: usize,
}

struct WindowStream {
    stream: tonic::Streaming<proto::LobDataBlock>,
    block: Vec<u8>,
    index: usize,
}

impl LobReader {
    pub(crate) fn new(
        client: ServiceClient,
        reference: proto::LobReference,
        position: u64,
        length: u64,
        max_outbound: usize,
    ) -> Self {
        Self {
            client,
            reference,
            cursor: position - 1,
            limit: position - 1 + length,
            window: None,
            finished: false,
            max_outbound,
        }
    }

    /// Returns the next byte, or `None` at end of stream.
    ///
    /// The byte value travels as `u8` end-to-end, so a 0xFF payload byte
    /// can never collide with an end-of-stream sentinel.
    pub async fn read_byte(&mut self) -> Result<Option<u8>> {
        if self.finished || self.cursor >= self.limit {
            self.finished = true;
            return Ok(None);
        }

        loop {
            if let Some(window) = self.window.as_mut() {
                if window.index < window.block.len() {
                    let byte = window.block[window.index];
                    window.index += 1;
                    self.cursor += 1;
                    return Ok(Some(byte));
                }

                match window.stream.message().await {
                    Ok(Some(next)) => {
                        window.block = next.payload;
                        window.index = 0;
                        continue;
                    },
                    Ok(None) => {
                        // Off the 2-block boundary the window was the last
                        // one; exactly on it another fetch is required.
                        if self.cursor > 1 && self.cursor % READ_WINDOW as u64 != 0 {
                            self.finished = true;
                            return Ok(None);
                        }
                        self.window = None;
                    },
                    Err(status) => return Err(DriverError::from(status)),
                }
            }

            let request = proto::ReadLobRequest {
                reference: Some(self.reference.clone()),
                position: (self.cursor + 1) as i64,
                length: READ_WINDOW as i64,
            };
            check_outbound_size(&request, self.max_outbound)?;

            let mut stream = self
                .client
                .read_lob(request)
                .await
                .map_err(DriverError::from)?
                .into_inner();

            match stream.message().await.map_err(DriverError::from)? {
                None => {
                    self.finished = true;
                    return Ok(None);
                },
                Some(first) => {
                    if first.position == -1 && first.payload.is_empty() {
                        self.finished = true;
                        return Ok(None);
                    }
                    self.window = Some(WindowStream { stream, block: first.payload, index: 0 });
                },
            }
        }
    }

    /// Fills `buf` with as many bytes as remain, returning the count.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.read_byte().await? {
                Some(byte) => {
                    buf[filled] = byte;
                    filled += 1;
                },
                None => break,
            }
        }
        Ok(filled)
    }

    /// Drains the remaining bytes into a vector.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        while let Some(byte) = self.read_byte().await? {
            bytes.push(byte);
        }
        Ok(bytes)
    }
}


#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod proptest_tests {
    use proptest::prelude::*;

    use super::*;

    fn run_on_runtime(
        payload: Vec<u8>,
    ) -> (usize, usize, Vec<i64>) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let settings = FrameSettings {
                session: Session::new(proto::SessionInfo {
                    session_id: "s".to_owned(),
                    db_family: proto::DbFamily::Postgresql as i32,
                    ..Default::default()
                }),
                kind: proto::LobKind::Binary,
                family: proto::DbFamily::Postgresql,
                base_position: 1,
                declared_length: None,
                metadata: Vec::new(),
                max_outbound: ojp_proto::DEFAULT_MAX_MESSAGE_SIZE,
            };
            let (mut writer, reader) = tokio::io::duplex(4096);
            let (tx, mut rx) = tokio::sync::mpsc::channel(8);
            let (first_tx, first_rx) = tokio::sync::oneshot::channel();
            first_tx
                .send(Ok(proto::LobReference {
                    identifier: "lob".to_owned(),
                    session: None,
                    kind: 0,
                }))
                .unwrap();

            let framer = tokio::spawn(pump_frames(
                settings,
                reader,
                tx,
                first_rx,
                CancellationToken::new(),
            ));
            let collector = tokio::spawn(async move {
                let mut frames = Vec::new();
                while let Some(block) = rx.recv().await {
                    frames.push(block);
                }
                frames
            });

            writer.write_all(&payload).await.unwrap();
            writer.shutdown().await.unwrap();
            drop(writer);
            framer.await.unwrap().unwrap();
            let frames = collector.await.unwrap();

            let data: usize = frames.iter().skip(1).map(|f| f.payload.len()).sum();
            let positions: Vec<i64> = frames.iter().map(|f| f.position).collect();
            (frames.len(), data, positions)
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        /// A write of N bytes produces one start frame plus ceil(N/1024)
        /// data frames whose payloads sum to N, at positions 1 + i*1024.
        #[test]
        fn prop_frame_shape(n in 0usize..10_000) {
            let payload: Vec<u8> = (0..n).map(|i| (i % 256) as u8).collect();
            let (frame_count, data_len, positions) = run_on_runtime(payload);

            let expected_data_frames = n.div_ceil(MAX_LOB_BLOCK_SIZE);
            prop_assert_eq!(frame_count, 1 + expected_data_frames);
            prop_assert_eq!(data_len, n);

            prop_assert_eq!(positions[0], 1);
            for (i, position) in positions.iter().skip(1).enumerate() {
                prop_assert_eq!(*position, 1 + (i * MAX_LOB_BLOCK_SIZE) as i64);
            }
        }
    }
}
