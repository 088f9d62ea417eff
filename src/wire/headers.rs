//! Posting personas
//!
//! `From`, `User-Agent`, and `Organization` values rotate per connection
//! session, never per article. All values are innocuous and carry no
//! correlation with the payload, sender, or folder.

const FROM_POOL: &[&str] = &[
    "reader@nowhere.invalid",
    "poster@unknown.invalid",
    "user@localhost.invalid",
    "anon@nothing.invalid",
    "news@somewhere.invalid",
];

const USER_AGENT_POOL: &[&str] = &[
    "Pan/0.154",
    "slrn/1.0.3",
    "Thunderbird/115.0",
    "KNode/4.14",
    "Xnews/2020.01",
];

const ORGANIZATION_POOL: &[&str] = &[
    "none",
    "private",
    "unlisted",
    "n/a",
];

/// Header values for one connection session.
#[derive(Debug, Clone)]
pub struct Persona {
    pub from: &'static str,
    pub user_agent: &'static str,
    pub organization: &'static str,
}

impl Persona {
    /// Draw a persona for a new session.
    pub fn next_session() -> Self {
        Persona {
            from: FROM_POOL[fastrand::usize(0..FROM_POOL.len())],
            user_agent: USER_AGENT_POOL[fastrand::usize(0..USER_AGENT_POOL.len())],
            organization: ORGANIZATION_POOL[fastrand::usize(0..ORGANIZATION_POOL.len())],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persona_draws_from_pools() {
        let persona = Persona::next_session();
        assert!(FROM_POOL.contains(&persona.from));
        assert!(USER_AGENT_POOL.contains(&persona.user_agent));
        assert!(ORGANIZATION_POOL.contains(&persona.organization));
    }
}
