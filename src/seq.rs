//! See [`Seq`].

use std::{
    cmp::Ordering,
    ops::{Add, AddAssign, Sub, SubAssign},
};

use arbitrary::Arbitrary;

/// Sequence number uniquely identifying an item sent across a network.
///
/// The same type numbers both packets and reliable messages - the two
/// sequence spaces are independent, but behave identically.
///
/// The number is stored internally as a [`u16`], which means it will wrap
/// around fairly quickly as many packets can be sent per second. Users of a
/// sequence number should take this into account, and use the custom
/// [`Seq::cmp`] implementation which takes wraparound into consideration.
///
/// # Wraparound
///
/// Operations on [`Seq`] must take into account wraparound, as it is
/// inevitable that it will eventually occur in the program - a [`u16`] is
/// relatively very small.
///
/// The sequence number can be visualized as an infinite number line, where
/// [`u16::MAX`] is right before `0`, `0` is before `1`, etc.:
///
/// ```text
///     65534  65535    0      1      2
/// ... --|------|------|------|------|-- ...
/// ```
///
/// [Addition](std::ops::Add) and [subtraction](std::ops::Sub) will always
/// wrap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Arbitrary)]
pub struct Seq(pub u16);

impl Seq {
    /// Sequence number with value `0`.
    pub const ZERO: Seq = Seq(0);

    /// Sequence number with value [`u16::MAX`].
    pub const MAX: Seq = Seq(u16::MAX);

    /// Gets a signed number for the value of sequences "elapsed" between
    /// `rhs` and `self`.
    ///
    /// This is effectively `rhs - self`, but taking into account wraparound
    /// and therefore returning a signed value. This will always return the
    /// smallest path around the number circle.
    ///
    /// # Example
    ///
    /// ```
    /// # use wireline::seq::Seq;
    /// assert_eq!(Seq(0).dist_to(Seq(5)), 5);
    /// assert_eq!(Seq(2).dist_to(Seq(0)), -2);
    /// assert_eq!(Seq::MAX.dist_to(Seq(0)), 1);
    /// assert_eq!(Seq(0).dist_to(Seq::MAX), -1);
    /// ```
    #[must_use]
    pub const fn dist_to(self, rhs: Self) -> i16 {
        #[allow(clippy::cast_possible_wrap)] // that's exactly what we want
        (rhs.0.wrapping_sub(self.0) as i16)
    }
}

impl Ord for Seq {
    /// Logically compares `self` to `other` in a way that respects
    /// wrap-around of sequence numbers, treating e.g. `0 cmp 1` as [`Less`]
    /// (as expected), but `0 cmp 65535` as [`Greater`].
    ///
    /// `a > b` here is the canonical "more recent" test: it holds iff
    /// `(a > b && a - b <= 32768) || (a < b && b - a > 32768)` on the raw
    /// values. The relation is antisymmetric for all distinct pairs,
    /// including the pair at exactly half the sequence space apart.
    ///
    /// [`Less`]: Ordering::Less
    fn cmp(&self, other: &Self) -> Ordering {
        let (s1, s2) = (self.0, other.0);
        if s1 == s2 {
            Ordering::Equal
        } else if ((s1 > s2) && (s1 - s2 <= 32768)) || ((s1 < s2) && (s2 - s1 > 32768)) {
            Ordering::Greater
        } else {
            Ordering::Less
        }
    }
}

impl PartialOrd for Seq {
    /// See [`Seq::cmp`].
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Add for Seq {
    type Output = Seq;

    fn add(self, rhs: Seq) -> Self::Output {
        Self(self.0.wrapping_add(rhs.0))
    }
}

impl AddAssign for Seq {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sub for Seq {
    type Output = Seq;

    fn sub(self, rhs: Seq) -> Self::Output {
        Self(self.0.wrapping_sub(rhs.0))
    }
}

impl SubAssign for Seq {
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}
