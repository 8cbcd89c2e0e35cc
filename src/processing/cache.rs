//! KV cache save/restore exchanges.
//!
//! Shares the channel and codec with the chat path but never touches the
//! demultiplexer: each exchange is exactly one request frame and one reply.

use std::time::Duration;

use tracing::debug;

use super::demux::expect_ack;
use crate::channel::Channel;
use crate::codec::Frame;
use crate::error::{Result, SessionError};
use crate::types::PrefixCache;

/// Check a cache before it is offered to a freshly initialized model
pub fn check_loadable(cache: &PrefixCache, context_length: u32) -> Result<()> {
    cache.validate()?;
    if cache.num_tokens() > context_length as usize {
        return Err(SessionError::invalid_argument(
            "prefix_cache",
            format!(
                "{} cached tokens exceed the context length of {}",
                cache.num_tokens(),
                context_length
            ),
        ));
    }
    Ok(())
}

/// Ask the engine for the key/value tensors of the last `token_count` tokens
pub async fn save(channel: &mut Channel, token_count: u32, timeout: Duration) -> Result<PrefixCache> {
    channel
        .send_frame(&Frame::CacheSaveRequest { token_count })
        .await?;

    match channel.receive(timeout).await? {
        Frame::CacheSaveResponse(cache) => {
            cache.validate().map_err(|e| {
                SessionError::Protocol(format!("engine returned a malformed cache: {}", e))
            })?;
            if cache.num_tokens() != token_count as usize {
                return Err(SessionError::Protocol(format!(
                    "requested {} tokens, engine returned {}",
                    token_count,
                    cache.num_tokens()
                )));
            }
            debug!(
                layers = cache.num_layers(),
                tokens = cache.num_tokens(),
                "Saved prefix cache"
            );
            Ok(cache)
        }
        Frame::Error(report) => Err(report.into_error()),
        other => Err(SessionError::Protocol(format!(
            "unexpected {} frame in reply to CACHE_SAVE_REQUEST",
            other.tag()
        ))),
    }
}

/// Restore a previously saved cache into the engine
pub async fn load(channel: &mut Channel, cache: &PrefixCache, timeout: Duration) -> Result<()> {
    channel
        .send_frame(&Frame::CacheLoadRequest(cache.clone()))
        .await?;
    let reply = channel.receive(timeout).await?;
    expect_ack(reply, "CACHE_LOAD_REQUEST")?;
    debug!(tokens = cache.num_tokens(), "Loaded prefix cache");
    Ok(())
}
