//! Ordered collection reconciliation
//!
//! Retained entries outside the longest common subsequence of the observed
//! and desired orders are moved; everything in it stays put. Moves are
//! emitted from the back of the desired order so each one can be anchored on
//! an entry that is already in its final place. Added entries are placed as
//! they are created, anchored on the next retained entry.

use crate::client::Position;
use std::collections::{BTreeSet, HashSet};

/// One planned reposition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Move {
    pub name: String,
    pub position: Position,
}

/// Repositioning needed to bring a collection into desired order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderPlan {
    /// Moves of retained entries, to be applied in order after deletes
    pub moves: Vec<Move>,
    /// Where each added entry goes, in desired order, once moves are done
    pub placements: Vec<Move>,
}

/// Plan moves and placements from the observed to the desired order
///
/// Entries only in `observed` are being deleted and play no part.
pub fn reconcile_order(observed: &[String], desired: &[String]) -> OrderPlan {
    let wanted: HashSet<&str> = desired.iter().map(String::as_str).collect();
    let present: HashSet<&str> = observed.iter().map(String::as_str).collect();

    let retained_observed: Vec<String> = observed
        .iter()
        .filter(|n| wanted.contains(n.as_str()))
        .cloned()
        .collect();
    let retained_desired: Vec<String> = desired
        .iter()
        .filter(|n| present.contains(n.as_str()))
        .cloned()
        .collect();

    let mut placements = Vec::new();
    for (i, name) in desired.iter().enumerate() {
        if present.contains(name.as_str()) {
            continue;
        }
        let anchor = desired[i + 1..].iter().find(|n| present.contains(n.as_str()));
        placements.push(Move {
            name: name.clone(),
            position: anchor.map_or(Position::Bottom, |a| Position::Before(a.clone())),
        });
    }

    OrderPlan {
        moves: plan_moves(&retained_observed, &retained_desired),
        placements,
    }
}

/// Longest common subsequence of two name sequences
///
/// Ties keep the earliest entries of `a`.
pub fn lcs<'a>(a: &'a [String], b: &[String]) -> Vec<&'a str> {
    let (n, m) = (a.len(), b.len());
    // table[i][j] = LCS length of a[i..] and b[j..]
    let mut table = vec![vec![0usize; m + 1]; n + 1];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            table[i][j] = if a[i] == b[j] {
                table[i + 1][j + 1] + 1
            } else {
                table[i + 1][j].max(table[i][j + 1])
            };
        }
    }

    let mut out = Vec::with_capacity(table[0][0]);
    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if a[i] == b[j] {
            out.push(a[i].as_str());
            i += 1;
            j += 1;
        } else if table[i][j + 1] > table[i + 1][j] {
            j += 1;
        } else {
            i += 1;
        }
    }
    out
}

/// Minimum moves turning `current` into `desired`
///
/// Both sequences must hold the same names. The result has exactly
/// `len - |lcs|` moves and must be applied in order.
pub fn plan_moves(current: &[String], desired: &[String]) -> Vec<Move> {
    let stay: BTreeSet<&str> = lcs(current, desired).into_iter().collect();
    let mut moves = Vec::new();
    for (i, name) in desired.iter().enumerate().rev() {
        if stay.contains(name.as_str()) {
            continue;
        }
        let position = match desired.get(i + 1) {
            Some(next) => Position::Before(next.clone()),
            None => Position::Bottom,
        };
        moves.push(Move {
            name: name.clone(),
            position,
        });
    }
    moves
}

/// Apply one move to a name sequence
///
/// Returns false when the entry or its pivot is missing.
pub fn apply_move(order: &mut Vec<String>, name: &str, position: &Position) -> bool {
    let Some(from) = order.iter().position(|n| n == name) else {
        return false;
    };
    let entry = order.remove(from);
    let to = match position {
        Position::Top => 0,
        Position::Bottom => order.len(),
        Position::Before(pivot) => match order.iter().position(|n| n == pivot) {
            Some(index) => index,
            None => {
                order.insert(from, entry);
                return false;
            }
        },
    };
    order.insert(to, entry);
    true
}
