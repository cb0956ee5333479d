//! Pairwise exchange-and-merge, the only step that moves data between workers.

use std::cmp::Ordering;
use std::time::Duration;

use log::{debug, trace};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::codec::{decode_items, encode_items};
use crate::comm::{Communicator, Tag, recv_within};
use crate::error::{CommError, SortError};

/// Which half of a merged pair a worker keeps.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Keep the low partition
    Down,
    /// Keep the high partition
    Up,
}

/// Per-exchange knobs taken from the sort configuration.
#[derive(Clone, Copy, Debug, Default)]
pub struct ExchangeOptions {
    pub timeout: Option<Duration>,
    pub compress: bool,
}

/// What one exchange moved, for the timing log.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExchangeStats {
    pub partner: usize,
    pub sent: usize,
    pub received: usize,
    pub kept: usize,
}

/// Merges two ascending sequences. On ties the element from `first` comes first.
pub fn merge_sorted<T, F>(first: Vec<T>, second: Vec<T>, compare: &F) -> Vec<T>
where
    F: Fn(&T, &T) -> Ordering,
{
    let mut merged = Vec::with_capacity(first.len() + second.len());
    let mut a = first.into_iter().peekable();
    let mut b = second.into_iter().peekable();
    loop {
        let take_second = match (a.peek(), b.peek()) {
            (Some(x), Some(y)) => compare(y, x) == Ordering::Less,
            (Some(_), None) => false,
            (None, Some(_)) => true,
            (None, None) => break,
        };
        let next = if take_second { b.next() } else { a.next() };
        merged.extend(next);
    }
    merged
}

/// Cuts the merged list of a pair into the part `direction` keeps.
///
/// `max_min` is the larger of the two minima and `min_max` the smaller of the
/// two maxima. Everything strictly below `max_min` goes low and everything
/// strictly above `min_max` goes high, even past the half-way mark; only the
/// elements between the two boundaries are divided by count. Both partners run
/// this on the same list, so the two kept parts always tile it exactly.
pub fn split_merged<T, F>(
    mut full: Vec<T>,
    max_min: &T,
    min_max: &T,
    direction: Direction,
    compare: &F,
) -> Vec<T>
where
    F: Fn(&T, &T) -> Ordering,
{
    let half = full.len() / 2;
    match direction {
        Direction::Down => {
            let keep = full
                .iter()
                .enumerate()
                .take_while(|(j, x)| {
                    (compare(x, max_min) == Ordering::Less || *j < half)
                        && compare(x, min_max) != Ordering::Greater
                })
                .count();
            full.truncate(keep);
            full
        }
        Direction::Up => {
            let keep = full
                .iter()
                .enumerate()
                .rev()
                .take_while(|(j, x)| {
                    compare(x, max_min) != Ordering::Less
                        && (*j >= half || compare(x, min_max) == Ordering::Greater)
                })
                .count();
            let start = full.len() - keep;
            full.split_off(start)
        }
    }
}

fn max_by<'a, T, F: Fn(&T, &T) -> Ordering>(a: &'a T, b: &'a T, compare: &F) -> &'a T {
    if compare(a, b) == Ordering::Less { b } else { a }
}

fn min_by<'a, T, F: Fn(&T, &T) -> Ordering>(a: &'a T, b: &'a T, compare: &F) -> &'a T {
    if compare(b, a) == Ordering::Less { b } else { a }
}

/// Swaps `ours` with `partner`'s partition and keeps the `direction` half of
/// the merged pair.
///
/// Both the send and the receive must complete before anything is merged.
/// `ours` must be non-empty and sorted ascending under `compare`, and so must
/// the partner's data; an empty side fails with `EmptyPartition`.
pub async fn exchange_and_merge<C, T, F>(
    comm: &C,
    partner: usize,
    tag: Tag,
    ours: &mut Vec<T>,
    direction: Direction,
    compare: &F,
    options: ExchangeOptions,
) -> Result<ExchangeStats, SortError>
where
    C: Communicator,
    T: Serialize + DeserializeOwned + Clone + Send + Sync,
    F: Fn(&T, &T) -> Ordering + Sync,
{
    let rank = comm.rank();
    if partner >= comm.size() || partner == rank {
        return Err(CommError::RankOutOfRange {
            rank: partner,
            size: comm.size(),
        }
        .into());
    }
    if ours.is_empty() {
        return Err(SortError::EmptyPartition { ranks: vec![rank] });
    }
    trace!(
        "[Exchange] rank {} <-> {} {:?} keeps {:?}",
        rank, partner, tag, direction
    );

    let payload = encode_items(ours, options.compress).await?;
    let (_, received) = tokio::try_join!(
        comm.send(partner, tag, payload),
        recv_within(comm, partner, tag, options.timeout)
    )?;
    let theirs: Vec<T> = decode_items(&received, partner).await?;
    let (Some(their_first), Some(their_last)) = (theirs.first(), theirs.last()) else {
        return Err(SortError::EmptyPartition {
            ranks: vec![partner],
        });
    };
    let (our_first, our_last) = (&ours[0], &ours[ours.len() - 1]);
    let max_min = max_by(our_first, their_first, compare).clone();
    let min_max = min_by(our_last, their_last, compare).clone();

    let sent = ours.len();
    let received = theirs.len();
    let mine = std::mem::take(ours);
    // lower rank first, so both partners build the identical list
    let full = if rank < partner {
        merge_sorted(mine, theirs, compare)
    } else {
        merge_sorted(theirs, mine, compare)
    };
    *ours = split_merged(full, &max_min, &min_max, direction, compare);

    debug!(
        "[Exchange] rank {} <-> {} {:?}: sent {}, received {}, kept {}",
        rank,
        partner,
        tag,
        sent,
        received,
        ours.len()
    );
    Ok(ExchangeStats {
        partner,
        sent,
        received,
        kept: ours.len(),
    })
}
