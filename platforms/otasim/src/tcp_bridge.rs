//! The transparent data link, carried over TCP.
//!
//! While the simulated module is in data mode, it forwards whatever the MCU
//! transmits to a [`TcpBridge`], and the bridge feeds whatever arrives on the
//! socket back through the module's UART.

use otafw::sim::{Peer, Wire};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    runtime::Handle,
    sync::mpsc,
    task::JoinHandle,
};
use tracing::{debug, info_span, trace, warn, Instrument};

pub struct TcpBridge {
    handle: Handle,
    reader: Option<OwnedReadHalf>,
    read_chunk: usize,
    outgoing: mpsc::UnboundedSender<u8>,
}

impl TcpBridge {
    /// Splits `stream` and starts its writer task.
    ///
    /// Must be called from within a tokio runtime. The returned task finishes
    /// once the bridge is dropped and everything the MCU sent has been
    /// written.
    pub fn spawn(stream: TcpStream, read_chunk: usize) -> (Self, JoinHandle<()>) {
        let (reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_out(writer, rx).instrument(info_span!("tcp_tx")));
        let bridge = Self {
            handle: Handle::current(),
            reader: Some(reader),
            read_chunk,
            outgoing: tx,
        };
        (bridge, writer)
    }
}

impl Peer for TcpBridge {
    fn connected(&mut self, wire: Wire) {
        let Some(reader) = self.reader.take() else {
            warn!("data link connected twice");
            return;
        };
        let chunk = self.read_chunk;
        self.handle
            .spawn(read_in(reader, wire, chunk).instrument(info_span!("tcp_rx")));
    }

    fn on_byte(&mut self, byte: u8) {
        if self.outgoing.send(byte).is_err() {
            trace!(byte, "sender gone, dropping byte");
        }
    }
}

async fn read_in(mut reader: OwnedReadHalf, wire: Wire, chunk: usize) {
    let mut buf = vec![0u8; chunk];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                debug!("socket closed by sender");
                return;
            }
            Ok(used) => {
                trace!(len = used, "Got incoming data");
                wire.send(&buf[..used]);
            }
            Err(error) => {
                warn!(%error, "Error reading from TCP stream");
                return;
            }
        }
    }
}

async fn write_out(mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<u8>) {
    let mut out = Vec::new();
    while let Some(byte) = rx.recv().await {
        out.push(byte);
        while let Ok(byte) = rx.try_recv() {
            out.push(byte);
        }
        trace!(len = out.len(), "Got outgoing data");
        if let Err(error) = writer.write_all(&out).await {
            warn!(%error, "Error writing to TCP stream");
            return;
        }
        out.clear();
    }
    if let Err(error) = writer.shutdown().await {
        debug!(%error, "shutting down TCP stream");
    }
}
