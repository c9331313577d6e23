use super::SidecarError;
use rand::Rng;
use std::net::TcpListener;
use std::ops::RangeInclusive;
use tracing::debug;

pub fn is_port_free(host: &str, port: u16) -> bool {
    TcpListener::bind((host, port)).is_ok()
}

/// Pick a bindable port: `preferred` first, then up to `candidates` ports of
/// `range` starting at a random offset and wrapping around.
pub fn allocate_port(
    host: &str,
    preferred: Option<u16>,
    range: RangeInclusive<u16>,
    candidates: usize,
) -> Result<u16, SidecarError> {
    if let Some(port) = preferred {
        if is_port_free(host, port) {
            return Ok(port);
        }
        debug!("Preferred port {} is occupied", port);
    }

    let (start, end) = (*range.start(), *range.end());
    if start > end {
        return Err(SidecarError::PortExhausted { start, end });
    }

    let span = (end - start) as usize + 1;
    let offset = rand::rng().random_range(0..span);
    for i in 0..candidates.min(span) {
        let port = start + ((offset + i) % span) as u16;
        if Some(port) == preferred {
            continue;
        }
        if is_port_free(host, port) {
            return Ok(port);
        }
    }

    Err(SidecarError::PortExhausted { start, end })
}
