// Copyright 2025 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::cell::Cell;

use crate::{Error, Result};

/// The lifecycle state of a [`Composition`][crate::Composition].
///
/// The only legal transitions form a cycle:
///
/// ```text
/// Unsealed -> Sealing -> Sealed -> Unsealing -> Unsealed
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CompositionState {
    /// Accepting place commands.
    Unsealed,
    /// Flushing place commands, then sorting and segmenting the keys.
    Sealing,
    /// The sorted keys and tile offsets are ready to be rendered.
    Sealed,
    /// Waiting for renders reading the composition to finish.
    Unsealing,
}

impl CompositionState {
    pub fn name(self) -> &'static str {
        match self {
            Self::Unsealed => "unsealed",
            Self::Sealing => "sealing",
            Self::Sealed => "sealed",
            Self::Unsealing => "unsealing",
        }
    }

    pub fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Unsealed, Self::Sealing)
                | (Self::Sealing, Self::Sealed)
                | (Self::Sealed, Self::Unsealing)
                | (Self::Unsealing, Self::Unsealed)
        )
    }
}

/// Move `state` to `to`, rejecting anything outside the transition table.
pub(crate) fn transition(state: &Cell<CompositionState>, to: CompositionState) -> Result<()> {
    let from = state.get();
    if !from.can_transition_to(to) {
        log::error!(
            "illegal composition transition from {} to {}",
            from.name(),
            to.name()
        );
        return Err(Error::IllegalTransition {
            object: "composition",
            from: from.name(),
            to: to.name(),
        });
    }
    log::debug!("composition {} -> {}", from.name(), to.name());
    state.set(to);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::{transition, CompositionState};
    use crate::Error;

    const ALL: [CompositionState; 4] = [
        CompositionState::Unsealed,
        CompositionState::Sealing,
        CompositionState::Sealed,
        CompositionState::Unsealing,
    ];

    #[test]
    fn exactly_one_successor_each() {
        for from in ALL {
            let legal: Vec<_> = ALL
                .into_iter()
                .filter(|&to| from.can_transition_to(to))
                .collect();
            assert_eq!(legal.len(), 1, "{from:?} has {legal:?}");
        }
    }

    #[test]
    fn full_cycle() {
        let state = Cell::new(CompositionState::Unsealed);
        for to in [
            CompositionState::Sealing,
            CompositionState::Sealed,
            CompositionState::Unsealing,
            CompositionState::Unsealed,
        ] {
            transition(&state, to).unwrap();
        }
        assert_eq!(state.get(), CompositionState::Unsealed);
    }

    #[test]
    fn rejected_transition_keeps_state() {
        let state = Cell::new(CompositionState::Sealed);
        assert_eq!(
            transition(&state, CompositionState::Sealing),
            Err(Error::IllegalTransition {
                object: "composition",
                from: "sealed",
                to: "sealing",
            })
        );
        assert_eq!(state.get(), CompositionState::Sealed);
    }
}
