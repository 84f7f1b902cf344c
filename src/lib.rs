#![forbid(unsafe_code)]

use std::io::{BufRead, Write};

use anyhow::{bail, Result};

mod bits;
mod blocks;
mod checksum;
mod codes;
mod huffman;
mod window;

pub mod deflate;
pub mod error;
pub mod inflate;
pub mod zip;

pub use deflate::{Deflater, Strategy};
pub use error::{CodecError, Decoded, Status};
pub use inflate::{GzipHeader, InflateConfig, Inflater, Wrapper};

/// Decompress a whole stream, driving an [`Inflater`] with whatever the
/// reader hands out. Gzip input may hold several members back to back; each
/// one is decoded in turn.
pub fn decompress<R: BufRead, W: Write>(
    mut input: R,
    mut output: W,
    wrapper: Wrapper,
) -> Result<u64> {
    let mut inflater = Inflater::new(InflateConfig { wrapper, window_bits: 15 })?;
    let mut outbuf = [0u8; 32 * 1024];
    let mut total = 0u64;
    let mut at_boundary = true;
    loop {
        let buf = input.fill_buf()?;
        if buf.is_empty() {
            if at_boundary {
                return Ok(total);
            }
            bail!("unexpected end of stream");
        }
        let decoded = inflater.decompress(buf, &mut outbuf)?;
        input.consume(decoded.consumed);
        output.write_all(&outbuf[..decoded.produced])?;
        total += decoded.produced as u64;
        match decoded.status {
            Status::StreamEnd => {
                if wrapper == Wrapper::Gzip {
                    inflater.reset();
                    at_boundary = true;
                } else {
                    return Ok(total);
                }
            }
            Status::NeedDict => bail!("stream requires a preset dictionary"),
            Status::Ok => {
                if decoded.consumed > 0 {
                    at_boundary = false;
                }
            }
        }
    }
}

/// Compress a whole stream with the given framing and block strategy.
pub fn compress<R: BufRead, W: Write>(
    mut input: R,
    mut output: W,
    wrapper: Wrapper,
    strategy: Strategy,
) -> Result<u64> {
    let mut deflater = Deflater::new(wrapper, strategy);
    loop {
        let buf = input.fill_buf()?;
        if buf.is_empty() {
            break;
        }
        let len = buf.len();
        deflater.write(buf);
        input.consume(len);
    }
    let stream = deflater.finish();
    output.write_all(&stream)?;
    Ok(stream.len() as u64)
}
