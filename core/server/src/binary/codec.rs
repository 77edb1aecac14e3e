/* Licensed to the Apache Software Foundation (ASF) under one
 * or more contributor license agreements.  See the NOTICE file
 * distributed with this work for additional information
 * regarding copyright ownership.  The ASF licenses this file
 * to you under the Apache License, Version 2.0 (the
 * "License"); you may not use this file except in compliance
 * with the License.  You may obtain a copy of the License at
 *
 *   http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing,
 * software distributed under the License is distributed on an
 * "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
 * KIND, either express or implied.  See the License for the
 * specific language governing permissions and limitations
 * under the License.
 */

//! Length-prefixed protobuf framing shared by both wire directions: a
//! little-endian u32 byte length followed by the encoded message.

use bytes::{BufMut, Bytes, BytesMut};
use prost::Message;
use strix_common::StrixError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame; anything larger is treated as malformed.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

pub fn encode_frame<T: Message>(message: &T) -> Bytes {
    let body_len = message.encoded_len();
    let mut frame = BytesMut::with_capacity(4 + body_len);
    frame.put_u32_le(body_len as u32);
    message
        .encode(&mut frame)
        .expect("frame buffer sized from encoded_len");
    frame.freeze()
}

pub async fn write_frame<T, W>(writer: &mut W, message: &T) -> Result<(), StrixError>
where
    T: Message,
    W: AsyncWrite + Unpin,
{
    writer.write_all(&encode_frame(message)).await?;
    Ok(())
}

/// Reads one frame. `Ok(None)` is a clean end of stream on the frame
/// boundary; errors inside a frame surface as IO errors.
pub async fn read_frame<T, R>(reader: &mut R) -> Result<Option<T>, StrixError>
where
    T: Message + Default,
    R: AsyncRead + Unpin,
{
    let mut length_bytes = [0u8; 4];
    match reader.read_exact(&mut length_bytes).await {
        Ok(_) => {}
        Err(error) if error.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(error) => return Err(error.into()),
    }
    let length = u32::from_le_bytes(length_bytes) as usize;
    if length > MAX_FRAME_BYTES {
        return Err(StrixError::MalformedRequest(format!(
            "frame of {length} bytes exceeds the {MAX_FRAME_BYTES} byte limit"
        )));
    }
    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await?;
    Ok(Some(T::decode(body.as_slice())?))
}
