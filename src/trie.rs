use std::borrow::Cow;
use std::collections::HashMap;

use thiserror::Error;

/// 单标签通配符：`*.example.com` 只匹配恰好多一级的子域名
const WILDCARD: &str = "*";
/// 子域名通配符：`.example.com` 匹配任意级子域名，不含自身
const DOT_WILDCARD: &str = "";
/// `+.example.com` 匹配自身以及任意级子域名
const COMPLEX_WILDCARD: &str = "+";

const MAX_DOMAIN_LEN: usize = 253;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TrieError {
    #[error("无效的域名规则 `{0}`")]
    InvalidPattern(String),
}

#[derive(Debug)]
struct Node<T> {
    children: HashMap<String, Node<T>>,
    data: Option<T>,
}

impl<T> Node<T> {
    fn new() -> Self {
        Self {
            children: HashMap::new(),
            data: None,
        }
    }
}

/// 按反转标签存储的域名前缀树
///
/// 支持的模式：
/// - `example.com` 精确匹配
/// - `*.example.com` 恰好一级子域名
/// - `.example.com` 任意级子域名（不含自身）
/// - `+.example.com` 自身及任意级子域名
///
/// 同一层级上精确标签优先于 `*`，`*` 优先于后缀通配符。
#[derive(Debug)]
pub struct AddressTrie<T> {
    root: Node<T>,
    len: usize,
}

impl<T> Default for AddressTrie<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> AddressTrie<T> {
    pub fn new() -> Self {
        Self {
            root: Node::new(),
            len: 0,
        }
    }

    /// 插入一条规则，重复插入同一模式会覆盖旧值
    pub fn insert(&mut self, pattern: &str, value: T) -> Result<(), TrieError> {
        let pattern = pattern.trim().trim_end_matches('.').to_ascii_lowercase();
        let labels = split_pattern(&pattern)?;

        let mut node = &mut self.root;
        for label in labels.iter().rev() {
            node = node
                .children
                .entry((*label).to_string())
                .or_insert_with(Node::new);
        }

        if node.data.replace(value).is_none() {
            self.len += 1;
        }
        Ok(())
    }

    /// 查找域名对应的值
    pub fn search(&self, domain: &str) -> Option<&T> {
        let domain = domain.trim_end_matches('.');
        if domain.is_empty() || domain.len() > MAX_DOMAIN_LEN {
            return None;
        }

        // 已经是小写时不分配内存
        let domain: Cow<'_, str> = if domain.bytes().any(|b| b.is_ascii_uppercase()) {
            Cow::Owned(domain.to_ascii_lowercase())
        } else {
            Cow::Borrowed(domain)
        };

        search_node(&self.root, Some(&domain))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

fn split_pattern(pattern: &str) -> Result<Vec<&str>, TrieError> {
    let invalid = || TrieError::InvalidPattern(pattern.to_string());

    if pattern.is_empty() || pattern.len() > MAX_DOMAIN_LEN {
        return Err(invalid());
    }

    let labels: Vec<&str> = pattern.split('.').collect();
    for (i, label) in labels.iter().enumerate() {
        let first = i == 0;
        let valid = match *label {
            DOT_WILDCARD | COMPLEX_WILDCARD => first && labels.len() > 1,
            WILDCARD => labels.len() > 1,
            _ => !label.contains(['*', '+']),
        };
        if !valid {
            return Err(invalid());
        }
    }

    Ok(labels)
}

/// `rest` 是还没走完的域名前缀，`None` 表示已经全部消耗
fn search_node<'a, T>(node: &'a Node<T>, rest: Option<&str>) -> Option<&'a T> {
    let rest = match rest {
        Some(rest) => rest,
        None => {
            if node.data.is_some() {
                return node.data.as_ref();
            }
            return node
                .children
                .get(COMPLEX_WILDCARD)
                .and_then(|child| child.data.as_ref());
        }
    };

    let (next, label) = match rest.rsplit_once('.') {
        Some((head, label)) => (Some(head), label),
        None => (None, rest),
    };
    if label.is_empty() {
        return None;
    }

    if let Some(child) = node.children.get(label) {
        if let Some(found) = search_node(child, next) {
            return Some(found);
        }
    }

    if let Some(child) = node.children.get(WILDCARD) {
        if let Some(found) = search_node(child, next) {
            return Some(found);
        }
    }

    // 后缀通配符：剩下至少还有一个标签
    [DOT_WILDCARD, COMPLEX_WILDCARD]
        .iter()
        .filter_map(|key| node.children.get(*key))
        .find_map(|child| child.data.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        let mut trie = AddressTrie::new();
        trie.insert("example.com", 1).unwrap();

        assert_eq!(trie.search("example.com"), Some(&1));
        assert_eq!(trie.search("www.example.com"), None);
        assert_eq!(trie.search("com"), None);
    }

    #[test]
    fn test_plus_wildcard_boundary() {
        let mut trie = AddressTrie::new();
        trie.insert("+.example.com", "proxy").unwrap();

        assert_eq!(trie.search("example.com"), Some(&"proxy"));
        assert_eq!(trie.search("a.example.com"), Some(&"proxy"));
        assert_eq!(trie.search("a.b.example.com"), Some(&"proxy"));
        // 后缀必须落在标签边界上
        assert_eq!(trie.search("notexample.com"), None);
        assert_eq!(trie.search("example.com.cn"), None);
    }

    #[test]
    fn test_star_wildcard_single_label() {
        let mut trie = AddressTrie::new();
        trie.insert("*.example.com", 1).unwrap();

        assert_eq!(trie.search("www.example.com"), Some(&1));
        assert_eq!(trie.search("example.com"), None);
        assert_eq!(trie.search("a.b.example.com"), None);
    }

    #[test]
    fn test_dot_wildcard_excludes_self() {
        let mut trie = AddressTrie::new();
        trie.insert(".example.com", 1).unwrap();

        assert_eq!(trie.search("example.com"), None);
        assert_eq!(trie.search("a.example.com"), Some(&1));
        assert_eq!(trie.search("a.b.example.com"), Some(&1));
    }

    #[test]
    fn test_exact_beats_wildcard() {
        let mut trie = AddressTrie::new();
        trie.insert("+.example.com", "suffix").unwrap();
        trie.insert("*.example.com", "star").unwrap();
        trie.insert("www.example.com", "exact").unwrap();

        assert_eq!(trie.search("www.example.com"), Some(&"exact"));
        assert_eq!(trie.search("api.example.com"), Some(&"star"));
        assert_eq!(trie.search("a.api.example.com"), Some(&"suffix"));
        assert_eq!(trie.search("example.com"), Some(&"suffix"));
    }

    #[test]
    fn test_case_and_trailing_dot() {
        let mut trie = AddressTrie::new();
        trie.insert("Example.COM", 7).unwrap();

        assert_eq!(trie.search("EXAMPLE.com."), Some(&7));
    }

    #[test]
    fn test_overwrite() {
        let mut trie = AddressTrie::new();
        trie.insert("example.com", 1).unwrap();
        trie.insert("example.com", 2).unwrap();

        assert_eq!(trie.search("example.com"), Some(&2));
        assert_eq!(trie.len(), 1);
    }

    #[test]
    fn test_invalid_patterns() {
        let mut trie: AddressTrie<()> = AddressTrie::new();
        assert!(trie.insert("", ()).is_err());
        assert!(trie.insert("a..com", ()).is_err());
        assert!(trie.insert("www.+.com", ()).is_err());
        assert!(trie.insert("+", ()).is_err());
        assert!(trie.insert("ab*.com", ()).is_err());
        assert!(trie.insert(&"a.".repeat(200), ()).is_err());
        assert!(trie.is_empty());
    }

    #[test]
    fn test_malformed_lookup() {
        let mut trie = AddressTrie::new();
        trie.insert("+.com", 1).unwrap();

        assert_eq!(trie.search(""), None);
        assert_eq!(trie.search("a..com"), None);
        assert_eq!(trie.search("x.com"), Some(&1));
    }
}
