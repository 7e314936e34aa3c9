use ferrous_dot_domain::Forwarder;
use std::net::SocketAddr;
use tracing::info;

/// Configured forwarders in preference order; the first entry is preferred.
///
/// Entries are only added at startup. Afterwards the only change is
/// [`ForwarderRegistry::set_bad`], which rotates a failed forwarder to the
/// back without disturbing the order of the others.
#[derive(Debug, Clone, Default)]
pub struct ForwarderRegistry {
    forwarders: Vec<Forwarder>,
}

impl ForwarderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_forwarder(&mut self, forwarder: Forwarder) {
        self.forwarders.push(forwarder);
    }

    /// Current preference order.
    pub fn get(&self) -> &[Forwarder] {
        &self.forwarders
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Forwarder> {
        self.forwarders.iter()
    }

    pub fn first(&self) -> Option<&Forwarder> {
        self.forwarders.first()
    }

    pub fn len(&self) -> usize {
        self.forwarders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forwarders.is_empty()
    }

    /// Move the forwarder whose remote address equals `forwarder`'s to the
    /// end of the list. Unknown addresses are ignored.
    pub fn set_bad(&mut self, forwarder: &Forwarder) {
        self.set_bad_address(&forwarder.remote);
    }

    /// Address-only form of [`Self::set_bad`]. With duplicate addresses only
    /// the first match moves.
    pub fn set_bad_address(&mut self, remote: &SocketAddr) {
        if let Some(index) = self.forwarders.iter().position(|f| f.remote == *remote) {
            self.forwarders[index..].rotate_left(1);
            info!(
                server = %remote,
                preferred = ?self.first().map(|f| f.remote),
                "Forwarder moved to the end of the preference list"
            );
        }
    }
}

impl FromIterator<Forwarder> for ForwarderRegistry {
    fn from_iter<I: IntoIterator<Item = Forwarder>>(iter: I) -> Self {
        Self {
            forwarders: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a ForwarderRegistry {
    type Item = &'a Forwarder;
    type IntoIter = std::slice::Iter<'a, Forwarder>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrous_dot_domain::Pin;

    fn forwarder(last_octet: u8) -> Forwarder {
        Forwarder::new(
            SocketAddr::from(([10, 0, 0, last_octet], 853)),
            format!("dns{}.example", last_octet),
            Pin::new([last_octet; 32]),
        )
    }

    fn order(registry: &ForwarderRegistry) -> Vec<u8> {
        registry
            .iter()
            .map(|f| match f.remote {
                SocketAddr::V4(v4) => v4.ip().octets()[3],
                SocketAddr::V6(_) => unreachable!(),
            })
            .collect()
    }

    fn abc() -> ForwarderRegistry {
        [1, 2, 3].into_iter().map(forwarder).collect()
    }

    #[test]
    fn test_insertion_order_is_preference_order() {
        let mut registry = ForwarderRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.first().is_none());

        registry.add_forwarder(forwarder(1));
        registry.add_forwarder(forwarder(2));
        assert_eq!(order(&registry), vec![1, 2]);
        assert_eq!(registry.first(), Some(&forwarder(1)));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_set_bad_rotates_to_end() {
        let mut registry = abc();
        registry.set_bad(&forwarder(2));
        assert_eq!(order(&registry), vec![1, 3, 2]);
    }

    #[test]
    fn test_set_bad_first_entry() {
        let mut registry = abc();
        registry.set_bad(&forwarder(1));
        assert_eq!(order(&registry), vec![2, 3, 1]);
        assert_eq!(registry.first(), Some(&forwarder(2)));
    }

    #[test]
    fn test_set_bad_unknown_is_noop() {
        let mut registry = abc();
        registry.set_bad(&forwarder(9));
        assert_eq!(order(&registry), vec![1, 2, 3]);
    }

    #[test]
    fn test_set_bad_repeated_is_stable() {
        let mut registry = abc();
        registry.set_bad(&forwarder(2));
        registry.set_bad(&forwarder(2));
        registry.set_bad(&forwarder(2));
        assert_eq!(order(&registry), vec![1, 3, 2]);
    }

    #[test]
    fn test_set_bad_matches_address_only() {
        let mut registry = abc();
        let mut other = forwarder(2);
        other.hostname = "someone-else.example".to_string();
        other.pin = Pin::new([0; 32]);

        registry.set_bad(&other);
        assert_eq!(order(&registry), vec![1, 3, 2]);
    }

    #[test]
    fn test_set_bad_requires_exact_port() {
        let mut registry = abc();
        registry.set_bad_address(&SocketAddr::from(([10, 0, 0, 1], 53)));
        assert_eq!(order(&registry), vec![1, 2, 3]);
    }
}
