use std::io;

use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::metrics::Metrics;

/// 双向转发，任意一侧结束或出错时两侧一起关闭
/// ⚡ 64KB 缓冲区提高吞吐量
pub async fn relay<A, B>(inbound: A, outbound: B, metrics: Metrics) -> io::Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut inbound_read, mut inbound_write) = tokio::io::split(inbound);
    let (mut outbound_read, mut outbound_write) = tokio::io::split(outbound);

    let metrics_up = metrics.clone();
    let upload = async move {
        let mut buf = vec![0u8; 65536];
        loop {
            let n = inbound_read.read(&mut buf).await?;
            if n == 0 {
                return Ok::<(), io::Error>(());
            }
            outbound_write.write_all(&buf[..n]).await?;
            // 出站可能带缓冲（加密层），每次都要刷出去
            outbound_write.flush().await?;
            metrics_up.add_bytes_up(n as u64);
        }
    };

    let metrics_down = metrics;
    let download = async move {
        let mut buf = vec![0u8; 65536];
        loop {
            let n = outbound_read.read(&mut buf).await?;
            if n == 0 {
                return Ok::<(), io::Error>(());
            }
            inbound_write.write_all(&buf[..n]).await?;
            inbound_write.flush().await?;
            metrics_down.add_bytes_down(n as u64);
        }
    };

    tokio::select! {
        result = upload => {
            if let Err(ref e) = result {
                debug!("客户端到出站的数据传输结束: {}", e);
            }
            result
        }
        result = download => {
            if let Err(ref e) = result {
                debug!("出站到客户端的数据传输结束: {}", e);
            }
            result
        }
    }
}
