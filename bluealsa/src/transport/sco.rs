//! SCO telephony I/O: raw PCM passthrough over the acquired SCO socket, no RTP framing.
//!
//! Narrowband CVSD and wideband mSBC both produce/consume fixed-size PCM blocks per codec
//! frame; the socket itself carries codec frames back-to-back with no header at all, unlike
//! A2DP media.

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::{
    codec::Codec,
    pcm::PcmEndpoint,
    sock,
    transport::{thread_manager::WorkerHandle, Transport},
};

/// Reads PCM from the microphone FIFO, encodes it and writes codec frames to the SCO socket.
pub async fn run_encoder(transport: Transport, pcm: std::sync::Arc<PcmEndpoint>, mut codec: Box<dyn Codec>, mut handle: WorkerHandle) {
    handle.mark_running().await;

    let bt_fd = match transport.bt_fd().await {
        Some(fd) => fd,
        None => return,
    };

    let mut fifo = match pcm.open_for_daemon().await {
        Ok(file) => file,
        Err(err) => {
            log::warn!("sco encoder: failed to open PCM FIFO: {err}");
            return;
        }
    };

    let block_frames = codec.block_frames();
    let mut pcm_buf = vec![0i16; block_frames];
    let mut pcm_bytes = vec![0u8; pcm_buf.len() * 2];
    let mut frame_buf = vec![0u8; block_frames * 2];

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
        let n = match codec.encode(&pcm_buf, &mut frame_buf) {
            Ok(n) => n,
            Err(err) => {
                log::debug!("sco encoder: encode failed: {err}");
                continue;
            }
        };
        if !pcm.is_active().await {
            continue;
        }
        if write_frame(&bt_fd, &frame_buf[..n]).await.is_err() {
            break;
        }
        if transport.is_stopping() {
            break;
        }
    }
}

/// Reads codec frames from the SCO socket, decodes them and writes PCM to the speaker FIFO.
pub async fn run_decoder(transport: Transport, pcm: std::sync::Arc<PcmEndpoint>, mut codec: Box<dyn Codec>, mut handle: WorkerHandle) {
    handle.mark_running().await;

    let bt_fd = match transport.bt_fd().await {
        Some(fd) => fd,
        None => return,
    };

    let mut fifo = match pcm.open_for_daemon().await {
        Ok(file) => file,
        Err(err) => {
            log::warn!("sco decoder: failed to open PCM FIFO: {err}");
            return;
        }
    };

    let block_frames = codec.block_frames();
    let mut pcm_buf = vec![0i16; block_frames];
    let mut pcm_bytes = vec![0u8; pcm_buf.len() * 2];
    let mut recv_buf = vec![0u8; block_frames * 2];

    loop {
        let n = tokio::select! {
            biased;
            _ = handle.cancelled() => break,
            result = read_frame(&bt_fd, &mut recv_buf) => match result {
                Ok(n) if n > 0 => n,
                _ => break,
            },
        };
        let frames = match codec.decode(&recv_buf[..n], &mut pcm_buf) {
            Ok(frames) => frames,
            Err(err) => {
                log::debug!("sco decoder: decode failed, dropping frame: {err}");
                continue;
            }
        };
        if !pcm.is_active().await {
            continue;
        }
        for (sample, bytes) in pcm_buf[..frames].iter().zip(pcm_bytes.chunks_exact_mut(2)) {
            bytes.copy_from_slice(&sample.to_le_bytes());
        }
        if fifo.write_all(&pcm_bytes[..frames * 2]).await.is_err() {
            break;
        }
        if transport.is_stopping() {
            break;
        }
    }
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
