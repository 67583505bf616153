//! A2DP media I/O loops: PCM FIFO on one side, RTP-framed codec frames over the acquired
//! Bluetooth socket on the other.
//!
//! Each direction is a standalone `tokio` task handed to [super::thread_manager::ThreadManager];
//! the source role encodes PCM read from the FIFO and sends RTP frames, the sink role receives
//! RTP frames and decodes into the FIFO. A transport only ever runs the one direction its kind
//! implies (`A2dpSource` encodes, `A2dpSink` decodes).

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::{
    codec::{Codec, CodecId},
    pcm::PcmEndpoint,
    rtp::{RtpHeader, RtpState, HEADER_LEN},
    sock,
    transport::{thread_manager::WorkerHandle, Transport},
};

/// Counters surfaced to logging/diagnostics for an A2DP direction; not part of the public D-Bus
/// surface but useful context when a stream misbehaves.
#[derive(Clone, Copy, Debug, Default)]
pub struct A2dpStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub dropped_unsupported_payload: u64,
    pub pcm_frames_lost_to_gaps: u64,
}

/// Reads PCM from `pcm`'s FIFO, encodes it with `codec`, frames it as RTP and writes it to the
/// transport's acquired Bluetooth socket, until cancelled.
pub async fn run_encoder(transport: Transport, pcm: std::sync::Arc<PcmEndpoint>, codec_id: CodecId, mut codec: Box<dyn Codec>, mut handle: WorkerHandle) {
    handle.mark_running().await;

    let bt_fd = match transport.bt_fd().await {
        Some(fd) => fd,
        None => return,
    };
    let (_mtu_read, mtu_write) = transport.mtu().await;

    let mut fifo = match pcm.open_for_daemon().await {
        Ok(file) => file,
        Err(err) => {
            log::warn!("a2dp encoder: failed to open PCM FIFO: {err}");
            return;
        }
    };

    let channels = pcm.channels() as usize;
    let block_frames = codec.block_frames();
    let mut pcm_buf = vec![0i16; block_frames * channels];
    let mut pcm_bytes = vec![0u8; pcm_buf.len() * 2];

    let mut codec_buf = vec![0u8; mtu_write.max(HEADER_LEN as u16 + 1) as usize];
    let sample_rate = pcm.sample_rate();
    let mut rtp = RtpState::new(sample_rate, codec_id.rtp_clock_rate(sample_rate), codec_id.rtp_payload_type());
    let mut stats = A2dpStats::default();

    loop {
        tokio::select! {
            biased;
            _ = handle.cancelled() => break,
            result = fifo.read_exact(&mut pcm_bytes) => {
                if result.is_err() {
                    break;
                }
            }
        }
        for (sample, bytes) in pcm_buf.iter_mut().zip(pcm_bytes.chunks_exact(2)) {
            *sample = i16::from_le_bytes([bytes[0], bytes[1]]);
        }

        let encoded_len = loop {
            match codec.encode(&pcm_buf, &mut codec_buf[HEADER_LEN..]) {
                Ok(n) => break n,
                Err(_) if codec_buf.len() < mtu_write as usize * 4 => {
                    // Undersized frame buffer: grow and retry once rather than dropping the block.
                    codec_buf.resize(codec_buf.len() * 2, 0);
                    continue;
                }
                Err(err) => {
                    log::warn!("a2dp encoder: encode failed: {err}");
                    continue;
                }
            }
        };

        // Paused: drop this block instead of sending it, satisfying "Pause is strictly observed
        // before the next frame is written" without blocking the client's FIFO writes.
        if !pcm.is_active().await {
            continue;
        }

        let header = rtp.next_header(block_frames as u32, false);
        header.write(&mut codec_buf[..HEADER_LEN]);
        let frame = &codec_buf[..HEADER_LEN + encoded_len];

        if write_frame(&bt_fd, frame).await.is_err() {
            break;
        }
        stats.frames_sent += 1;

        if transport.is_stopping() {
            break;
        }
    }

    log::debug!("a2dp encoder stopped after {} frames", stats.frames_sent);
}

/// Reads RTP frames from the transport's acquired Bluetooth socket, decodes them with `codec`
/// and writes PCM into `pcm`'s FIFO, until cancelled.
pub async fn run_decoder(transport: Transport, pcm: std::sync::Arc<PcmEndpoint>, expected_payload_type: u8, mut codec: Box<dyn Codec>, mut handle: WorkerHandle) {
    handle.mark_running().await;

    let bt_fd = match transport.bt_fd().await {
        Some(fd) => fd,
        None => return,
    };
    let (mtu_read, _mtu_write) = transport.mtu().await;

    let mut fifo = match pcm.open_for_daemon().await {
        Ok(file) => file,
        Err(err) => {
            log::warn!("a2dp decoder: failed to open PCM FIFO: {err}");
            return;
        }
    };

    let channels = pcm.channels() as usize;
    let block_frames = codec.block_frames();
    let mut pcm_buf = vec![0i16; block_frames * channels];
    let mut pcm_bytes = vec![0u8; pcm_buf.len() * 2];
    let mut recv_buf = vec![0u8; mtu_read.max(HEADER_LEN as u16 + 1) as usize];

    let sample_rate = pcm.sample_rate();
    let mut rtp = RtpState::new(sample_rate, 90_000, expected_payload_type);
    let mut stats = A2dpStats::default();

    loop {
        let n = tokio::select! {
            biased;
            _ = handle.cancelled() => break,
            result = read_frame(&bt_fd, &mut recv_buf) => match result {
                Ok(n) => n,
                Err(_) => break,
            },
        };
        if n < HEADER_LEN {
            continue;
        }
        let header = match RtpHeader::parse(&recv_buf[..n]) {
            Some(h) => h,
            None => continue,
        };
        // Unsupported payload type: drop the frame, count it, keep the stream alive.
        if header.payload_type != expected_payload_type {
            stats.dropped_unsupported_payload += 1;
            continue;
        }
        let gap = rtp.receive(&header);
        stats.pcm_frames_lost_to_gaps += gap.missing_pcm_frames as u64;

        let decoded_frames = match codec.decode(&recv_buf[HEADER_LEN..n], &mut pcm_buf) {
            Ok(n) => n,
            Err(err) => {
                log::debug!("a2dp decoder: decode failed, dropping frame: {err}");
                continue;
            }
        };
        if !pcm.is_active().await {
            continue;
        }

        let decoded_samples = decoded_frames * channels;
        for (sample, bytes) in pcm_buf[..decoded_samples].iter().zip(pcm_bytes.chunks_exact_mut(2)) {
            bytes.copy_from_slice(&sample.to_le_bytes());
        }
        if fifo.write_all(&pcm_bytes[..decoded_samples * 2]).await.is_err() {
            break;
        }
        stats.frames_received += 1;

        if transport.is_stopping() {
            break;
        }
    }

    log::debug!("a2dp decoder stopped after {} frames ({} gap frames)", stats.frames_received, stats.pcm_frames_lost_to_gaps);
}

async fn write_frame(bt_fd: &tokio::io::unix::AsyncFd<super::SharedFd>, frame: &[u8]) -> std::io::Result<()> {
    loop {
        let mut guard = bt_fd.writable().await?;
        match guard.try_io(|inner| sock::send(&inner.get_ref().0, frame, 0)) {
            Ok(result) => return result.map(|_| ()),
            Err(_would_block) => continue,
        }
    }
}

async fn read_frame(bt_fd: &tokio::io::unix::AsyncFd<super::SharedFd>, buf: &mut [u8]) -> std::io::Result<usize> {
    loop {
        let mut guard = bt_fd.readable().await?;
        let mut read_buf = tokio::io::ReadBuf::new(buf);
        match guard.try_io(|inner| sock::recv(&inner.get_ref().0, &mut read_buf, 0)) {
            Ok(result) => return result,
            Err(_would_block) => continue,
        }
    }
}
