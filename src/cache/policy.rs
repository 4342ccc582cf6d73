//! Per-category TTL and persistence policy
//!
//! Pure configuration consulted by the facade on every fetch. Policies are
//! loaded once at startup; the only runtime mutation is the user-configured
//! "max cache age" ceiling, which clamps every TTL downward and is re-read
//! on every lookup so a change applies without a restart.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

/// Cache policy for one named data category
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CategoryPolicy {
    /// How long an entry stays fresh
    pub ttl: Duration,
    /// Whether entries survive a restart via the disk tier
    pub persist: bool,
}

/// Well-known category names shared by the facade and the endpoint wrappers.
pub mod categories {
    pub const CHARACTER_INFO: &str = "character.info";
    pub const CHARACTER_SKILLS: &str = "character.skills";
    pub const CHARACTER_SKILLQUEUE: &str = "character.skillqueue";
    pub const CHARACTER_IMPLANTS: &str = "character.implants";
    pub const CHARACTER_CLONES: &str = "character.clones";
    pub const CHARACTER_ATTRIBUTES: &str = "character.attributes";
    pub const CHARACTER_LOCATION: &str = "character.location";
    pub const CHARACTER_WALLET: &str = "character.wallet";
    pub const CHARACTER_MAIL: &str = "character.mail";
    pub const CHARACTER_INDUSTRY: &str = "character.industry";
    pub const UNIVERSE_TYPE: &str = "universe.type";
    pub const UNIVERSE_GROUP: &str = "universe.group";
    pub const MARKET_PRICES: &str = "market.prices";
    pub const SERVER_STATUS: &str = "server.status";
}

/// Fallback for categories nobody registered a policy for
const DEFAULT_POLICY: CategoryPolicy = CategoryPolicy {
    ttl: Duration::from_secs(15 * 60),
    persist: false,
};

/// Maps category names to TTL/persistence policy, applying the user ceiling.
pub struct PolicyTable {
    policies: HashMap<&'static str, CategoryPolicy>,
    ceiling: RwLock<Option<Duration>>,
}

impl PolicyTable {
    /// Build the standard policy table.
    ///
    /// Character state is short-lived; static universe and market data is
    /// long-lived and worth keeping across restarts.
    pub fn new(ceiling: Option<Duration>) -> Self {
        use categories::*;

        let mut policies = HashMap::new();
        let mut add = |category, secs, persist| {
            policies.insert(
                category,
                CategoryPolicy {
                    ttl: Duration::from_secs(secs),
                    persist,
                },
            );
        };

        add(CHARACTER_INFO, 24 * 60 * 60, true); // public info barely changes
        add(CHARACTER_SKILLS, 60 * 60, true);
        add(CHARACTER_SKILLQUEUE, 60, false); // queue shifts constantly
        add(CHARACTER_IMPLANTS, 60 * 60, false);
        add(CHARACTER_CLONES, 60 * 60, false);
        add(CHARACTER_ATTRIBUTES, 60 * 60, false);
        add(CHARACTER_LOCATION, 5, false);
        add(CHARACTER_WALLET, 2 * 60, false);
        add(CHARACTER_MAIL, 5 * 60, false);
        add(CHARACTER_INDUSTRY, 10 * 60, false);
        add(UNIVERSE_TYPE, 24 * 60 * 60, true);
        add(UNIVERSE_GROUP, 24 * 60 * 60, true);
        add(MARKET_PRICES, 60 * 60, true);
        add(SERVER_STATUS, 30, false);

        Self {
            policies,
            ceiling: RwLock::new(ceiling),
        }
    }

    /// Update the user ceiling; takes effect on the next lookup.
    pub fn set_ceiling(&self, ceiling: Option<Duration>) {
        *self.ceiling.write().unwrap_or_else(|e| e.into_inner()) = ceiling;
    }

    /// Policy for a category with the ceiling applied.
    ///
    /// Unknown categories fall back to a conservative 15-minute,
    /// non-persisted policy.
    pub fn effective(&self, category: &str) -> CategoryPolicy {
        let base = self
            .policies
            .get(category)
            .copied()
            .unwrap_or(DEFAULT_POLICY);

        let ceiling = *self.ceiling.read().unwrap_or_else(|e| e.into_inner());
        match ceiling {
            Some(max) if max < base.ttl => CategoryPolicy {
                ttl: max,
                persist: base.persist,
            },
            _ => base,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_category() {
        let table = PolicyTable::new(None);
        let policy = table.effective(categories::CHARACTER_SKILLQUEUE);
        assert_eq!(policy.ttl, Duration::from_secs(60));
        assert!(!policy.persist);
    }

    #[test]
    fn test_unknown_category_falls_back() {
        let table = PolicyTable::new(None);
        let policy = table.effective("no.such.category");
        assert_eq!(policy.ttl, Duration::from_secs(15 * 60));
        assert!(!policy.persist);
    }

    #[test]
    fn test_persisted_categories() {
        let table = PolicyTable::new(None);
        assert!(table.effective(categories::UNIVERSE_TYPE).persist);
        assert!(table.effective(categories::MARKET_PRICES).persist);
        assert!(!table.effective(categories::CHARACTER_LOCATION).persist);
    }

    #[test]
    fn test_ceiling_clamps_downward_only() {
        let table = PolicyTable::new(Some(Duration::from_secs(120)));

        // Long TTLs clamp down to the ceiling
        let skills = table.effective(categories::CHARACTER_SKILLS);
        assert_eq!(skills.ttl, Duration::from_secs(120));
        // Persistence flag is untouched by the ceiling
        assert!(skills.persist);

        // Shorter TTLs are left alone
        let queue = table.effective(categories::CHARACTER_SKILLQUEUE);
        assert_eq!(queue.ttl, Duration::from_secs(60));
    }

    #[test]
    fn test_ceiling_change_applies_immediately() {
        let table = PolicyTable::new(None);
        assert_eq!(
            table.effective(categories::CHARACTER_SKILLS).ttl,
            Duration::from_secs(60 * 60)
        );

        table.set_ceiling(Some(Duration::from_secs(30)));
        assert_eq!(
            table.effective(categories::CHARACTER_SKILLS).ttl,
            Duration::from_secs(30)
        );

        table.set_ceiling(None);
        assert_eq!(
            table.effective(categories::CHARACTER_SKILLS).ttl,
            Duration::from_secs(60 * 60)
        );
    }
}
