//! `KeyRange`, the value object over `[lower, upper]` with open/closed
//! endpoints or exact match (spec §4.4).

use crate::key::SecondaryKey;

#[derive(Clone, Debug)]
pub struct KeyRange {
    pub lower: Option<SecondaryKey>,
    pub upper: Option<SecondaryKey>,
    pub lower_open: bool,
    pub upper_open: bool,
    pub exact_match: bool,
}

impl KeyRange {
    pub fn all() -> Self {
        Self {
            lower: None,
            upper: None,
            lower_open: false,
            upper_open: false,
            exact_match: false,
        }
    }

    pub fn lower_bound(k: SecondaryKey, open: bool) -> Self {
        Self {
            lower: Some(k),
            upper: None,
            lower_open: open,
            upper_open: false,
            exact_match: false,
        }
    }

    pub fn upper_bound(k: SecondaryKey, open: bool) -> Self {
        Self {
            lower: None,
            upper: Some(k),
            lower_open: false,
            upper_open: open,
            exact_match: false,
        }
    }

    pub fn bound(lower: SecondaryKey, upper: SecondaryKey, lower_open: bool, upper_open: bool) -> Self {
        Self {
            lower: Some(lower),
            upper: Some(upper),
            lower_open,
            upper_open,
            exact_match: false,
        }
    }

    pub fn only(k: SecondaryKey) -> Self {
        Self {
            lower: Some(k.clone()),
            upper: Some(k),
            lower_open: false,
            upper_open: false,
            exact_match: true,
        }
    }

    pub fn includes(&self, k: &SecondaryKey) -> bool {
        let lower_ok = match &self.lower {
            None => true,
            Some(l) => *l < *k || (!self.lower_open && *l == *k),
        };
        let upper_ok = match &self.upper {
            None => true,
            Some(u) => *u > *k || (!self.upper_open && *u == *k),
        };
        lower_ok && upper_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_is_an_exact_closed_match() {
        let r = KeyRange::only(SecondaryKey::Number(3.0));
        assert!(r.exact_match);
        assert!(r.includes(&SecondaryKey::Number(3.0)));
        assert!(!r.includes(&SecondaryKey::Number(3.1)));
    }

    #[test]
    fn open_endpoints_exclude_the_boundary() {
        let r = KeyRange::bound(SecondaryKey::Number(0.0), SecondaryKey::Number(10.0), true, true);
        assert!(!r.includes(&SecondaryKey::Number(0.0)));
        assert!(!r.includes(&SecondaryKey::Number(10.0)));
        assert!(r.includes(&SecondaryKey::Number(5.0)));
    }

    #[test]
    fn unbounded_sides_accept_anything() {
        let r = KeyRange::lower_bound(SecondaryKey::Number(5.0), false);
        assert!(r.includes(&SecondaryKey::Number(1_000_000.0)));
        assert!(!r.includes(&SecondaryKey::Number(4.9)));
    }
}
