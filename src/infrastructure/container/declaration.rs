//! 依赖声明解析
//!
//! 声明语法：
//! - `[?]target[:alias]`：注入 `target`，以 `alias` 作为键
//! - `[?]alias>target`：箭头写法，键在前，目标在后
//!
//! 前缀 `?` 表示可选依赖：找不到提供者时注入空值而不是报错。

use std::fmt;
use std::str::FromStr;

use crate::errors::DiError;

const OPTIONAL_FLAG: char = '?';
const ALIAS_SEPARATOR: char = ':';
const MAPPING_ARROW: char = '>';

/// 解析后的依赖声明
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DependencyDeclaration {
    /// 被查找的服务名
    pub target: String,
    /// 注入时使用的键
    pub alias: String,
    pub optional: bool,
}

impl DependencyDeclaration {
    /// 解析一个声明字符串
    pub fn parse(token: &str) -> Result<Self, DiError> {
        let trimmed = token.trim();
        let (optional, body) = match trimmed.strip_prefix(OPTIONAL_FLAG) {
            Some(rest) => (true, rest),
            None => (false, trimmed),
        };

        let (target, alias) = if let Some((alias, target)) = body.split_once(MAPPING_ARROW) {
            (target, alias)
        } else if let Some((target, alias)) = body.split_once(ALIAS_SEPARATOR) {
            (target, alias)
        } else {
            (body, body)
        };

        let is_valid = |part: &str| {
            !part.is_empty()
                && !part.contains([OPTIONAL_FLAG, ALIAS_SEPARATOR, MAPPING_ARROW])
                && !part.chars().any(char::is_whitespace)
        };
        if !is_valid(target) || !is_valid(alias) {
            return Err(DiError::BadDeclaration(token.to_string()));
        }

        Ok(Self {
            target: target.to_string(),
            alias: alias.to_string(),
            optional,
        })
    }

    /// 批量解析，遇到第一个错误即返回
    pub fn parse_all<I, S>(tokens: I) -> Result<Vec<Self>, DiError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        tokens
            .into_iter()
            .map(|token| Self::parse(token.as_ref()))
            .collect()
    }

    /// 直接引用某个服务的必需声明
    pub fn required(target: impl Into<String>) -> Self {
        let target = target.into();
        Self {
            alias: target.clone(),
            target,
            optional: false,
        }
    }

    pub fn is_aliased(&self) -> bool {
        self.alias != self.target
    }
}

impl FromStr for DependencyDeclaration {
    type Err = DiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for DependencyDeclaration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.optional {
            write!(f, "{}", OPTIONAL_FLAG)?;
        }
        if self.is_aliased() {
            write!(f, "{}{}{}", self.target, ALIAS_SEPARATOR, self.alias)
        } else {
            write!(f, "{}", self.target)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_declaration() {
        let decl = DependencyDeclaration::parse("db").unwrap();
        assert_eq!(decl, DependencyDeclaration::required("db"));
        assert!(!decl.is_aliased());
    }

    #[test]
    fn test_optional_with_alias() {
        let decl = DependencyDeclaration::parse("?pgsql:db").unwrap();
        assert_eq!(decl.target, "pgsql");
        assert_eq!(decl.alias, "db");
        assert!(decl.optional);
        assert_eq!(decl.to_string(), "?pgsql:db");
    }

    #[test]
    fn test_arrow_form_puts_alias_first() {
        let decl = DependencyDeclaration::parse("finalMappedDep>dep3").unwrap();
        assert_eq!(decl.target, "dep3");
        assert_eq!(decl.alias, "finalMappedDep");
        assert!(!decl.optional);
    }

    #[test]
    fn test_reserved_names_parse() {
        let decl = DependencyDeclaration::parse("$shutdown").unwrap();
        assert_eq!(decl.target, "$shutdown");
    }

    #[test]
    fn test_malformed_declarations() {
        for token in ["", "?", "a:", ":b", "a:b:c", "a>b:c", "??a", "a b"] {
            assert!(
                matches!(
                    DependencyDeclaration::parse(token),
                    Err(DiError::BadDeclaration(_))
                ),
                "token {token:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_parse_all_stops_on_error() {
        let parsed = DependencyDeclaration::parse_all(["a", "?b:c"]).unwrap();
        assert_eq!(parsed.len(), 2);
        assert!(DependencyDeclaration::parse_all(["a", ""]).is_err());
    }
}
