// SPDX-License-Identifier: CEPL-1.0

/// Outcome of an acquire or present against the swapchain.
///
/// `Stale` and `Suboptimal` are expected states, not errors: the frame loop
/// reacts by recreating the chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChainStatus {
    Optimal,
    Suboptimal,
    Stale,
}

impl ChainStatus {
    pub fn from_suboptimal(suboptimal: bool) -> Self {
        if suboptimal {
            Self::Suboptimal
        } else {
            Self::Optimal
        }
    }

    /// Rendering into the acquired image may go ahead.
    pub fn is_usable(self) -> bool {
        !matches!(self, Self::Stale)
    }

    /// After present, anything but `Optimal` rebuilds the chain.
    pub fn needs_recreate(self) -> bool {
        !matches!(self, Self::Optimal)
    }
}
