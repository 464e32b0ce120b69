//! Collective operations built on point-to-point messages.
//!
//! Every rank must enter the same collective on the same channel in the
//! same order, or the call blocks.

use crate::{Channel, Rank, Transport};
use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use xorstor_common::{Error, Result};

/// Deliver `payload` from `root` to every rank.
///
/// The root passes `Some(payload)`; other ranks pass `None` and receive it.
pub fn broadcast<T: Transport + ?Sized>(
    transport: &T,
    root: Rank,
    channel: Channel,
    payload: Option<Bytes>,
) -> Result<Bytes> {
    if transport.rank() == root {
        let payload =
            payload.ok_or_else(|| Error::protocol("broadcast root has nothing to send"))?;
        for peer in (0..transport.world_size()).filter(|&r| r != root) {
            transport.send(peer, channel, payload.clone())?;
        }
        Ok(payload)
    } else {
        transport.recv(root, channel)
    }
}

/// Collect one payload from every rank at `root`, in rank order.
///
/// Returns `Some` on the root and `None` elsewhere.
pub fn gather<T: Transport + ?Sized>(
    transport: &T,
    root: Rank,
    channel: Channel,
    payload: Bytes,
) -> Result<Option<Vec<Bytes>>> {
    if transport.rank() != root {
        transport.send(root, channel, payload)?;
        return Ok(None);
    }
    let mut all = Vec::with_capacity(transport.world_size());
    for peer in 0..transport.world_size() {
        if peer == root {
            all.push(payload.clone());
        } else {
            all.push(transport.recv(peer, channel)?);
        }
    }
    Ok(Some(all))
}

/// Block until every rank has entered the barrier.
pub fn barrier<T: Transport + ?Sized>(transport: &T, channel: Channel) -> Result<()> {
    gather(transport, 0, channel, Bytes::new())?;
    let release = (transport.rank() == 0).then(Bytes::new);
    broadcast(transport, 0, channel, release)?;
    Ok(())
}

/// [`broadcast`] a bincode-encoded value.
pub fn broadcast_value<T, V>(
    transport: &T,
    root: Rank,
    channel: Channel,
    value: Option<&V>,
) -> Result<V>
where
    T: Transport + ?Sized,
    V: Serialize + DeserializeOwned,
{
    let payload = value
        .map(|v| bincode::serialize(v))
        .transpose()?
        .map(Bytes::from);
    let bytes = broadcast(transport, root, channel, payload)?;
    Ok(bincode::deserialize(&bytes)?)
}

/// [`gather`] bincode-encoded values.
pub fn gather_values<T, V>(
    transport: &T,
    root: Rank,
    channel: Channel,
    value: &V,
) -> Result<Option<Vec<V>>>
where
    T: Transport + ?Sized,
    V: Serialize + DeserializeOwned,
{
    let payload = Bytes::from(bincode::serialize(value)?);
    gather(transport, root, channel, payload)?
        .map(|all| {
            all.iter()
                .map(|b| bincode::deserialize(b).map_err(Error::from))
                .collect::<Result<Vec<V>>>()
        })
        .transpose()
}
