use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use serde::{Deserialize, Serialize};

/// 一个入站用户
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthUser {
    pub user: String,
    pub pass: String,
}

impl AuthUser {
    /// 解析 `user:pass`
    pub fn parse(s: &str) -> Option<Self> {
        let (user, pass) = s.split_once(':')?;
        if user.is_empty() {
            return None;
        }
        Some(Self {
            user: user.to_string(),
            pass: pass.to_string(),
        })
    }
}

/// 用户名/密码校验
#[derive(Debug, Default)]
pub struct Authenticator {
    users: HashMap<String, String>,
}

impl Authenticator {
    pub fn new(users: &[AuthUser]) -> Self {
        Self {
            users: users
                .iter()
                .map(|u| (u.user.clone(), u.pass.clone()))
                .collect(),
        }
    }

    pub fn verify(&self, user: &str, pass: &str) -> bool {
        self.users.get(user).map_or(false, |p| p == pass)
    }

    pub fn users(&self) -> Vec<String> {
        let mut users: Vec<String> = self.users.keys().cloned().collect();
        users.sort();
        users
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

/// 入站共享的认证信息，重载时整体替换；为空表示不需要认证
pub type SharedAuthenticator = Arc<ArcSwapOption<Authenticator>>;

pub fn shared_authenticator() -> SharedAuthenticator {
    Arc::new(ArcSwapOption::empty())
}

/// 按用户列表更新，空列表关闭认证
pub fn update_authenticator(shared: &SharedAuthenticator, users: &[AuthUser]) {
    if users.is_empty() {
        shared.store(None);
    } else {
        shared.store(Some(Arc::new(Authenticator::new(users))));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_user() {
        let u = AuthUser::parse("alice:pa:ss").unwrap();
        assert_eq!(u.user, "alice");
        assert_eq!(u.pass, "pa:ss");
        assert!(AuthUser::parse("nopass").is_none());
        assert!(AuthUser::parse(":x").is_none());
    }

    #[test]
    fn test_verify_and_swap() {
        let shared = shared_authenticator();
        assert!(shared.load().is_none());

        update_authenticator(&shared, &[AuthUser::parse("alice:secret").unwrap()]);
        let auth = shared.load_full().unwrap();
        assert!(auth.verify("alice", "secret"));
        assert!(!auth.verify("alice", "wrong"));
        assert!(!auth.verify("bob", "secret"));
        assert_eq!(auth.users(), vec!["alice".to_string()]);

        update_authenticator(&shared, &[]);
        assert!(shared.load().is_none());
    }
}
