//! A complete directory held in memory. Used by the `ldap-server` binary and
//! as the backend in connection tests; also a worked example of the
//! `Backend` contract.

use crate::backend::{Backend, DerefAliases, RequestContext, SearchScope, SearchSink};
use crate::dn::{join_dn, split_dn, Rdn};
use crate::entry::{apply_values, get_values, Attributes, Modification, ModifyOperation};
use crate::filter::Filter;
use crate::result::{LdapError, LdapResult, ResultCode};
use crate::schema::Schema;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone)]
struct StoredEntry {
    /// DN as the client wrote it.
    dn: String,
    /// Case-folded RDNs, most specific first.
    rdns: Vec<Rdn>,
    attrs: Attributes,
}

impl StoredEntry {
    fn is_under(&self, base: &[Rdn]) -> bool {
        self.rdns.len() >= base.len() && self.rdns[self.rdns.len() - base.len()..] == *base
    }

    fn in_scope(&self, base: &[Rdn], scope: SearchScope) -> bool {
        match scope {
            SearchScope::BaseObject => self.rdns == base,
            SearchScope::SingleLevel => self.rdns.len() == base.len() + 1 && self.is_under(base),
            SearchScope::WholeSubtree => self.is_under(base),
        }
    }
}

fn fold(rdns: Vec<Rdn>) -> Vec<Rdn> {
    rdns.into_iter()
        .map(|rdn| rdn.into_iter().map(|(a, v)| (a, v.trim().to_lowercase())).collect())
        .collect()
}

fn parse_dn(dn: &str) -> LdapResult<Vec<Rdn>> {
    split_dn(dn)
        .map(fold)
        .map_err(|e| LdapError::new(ResultCode::InvalidDnSyntax, e.message))
}

fn key(rdns: &[Rdn]) -> String {
    join_dn(rdns)
}

/// Does `attrs` hold `value` for `attr`, compared case-insensitively?
fn has_value(attrs: &Attributes, attr: &str, value: &str) -> bool {
    get_values(attrs, attr)
        .map(|vals| vals.iter().any(|v| v.trim().eq_ignore_ascii_case(value)))
        .unwrap_or(false)
}

pub struct MemoryBackend {
    entries: RwLock<BTreeMap<String, StoredEntry>>,
    schema: Option<Arc<Schema>>,
    /// Top-level entries that may be created without a parent.
    suffixes: Vec<Vec<Rdn>>,
    root: Option<(Vec<Rdn>, String)>,
}

impl MemoryBackend {
    pub fn new(schema: Option<Arc<Schema>>) -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            schema,
            suffixes: Vec::new(),
            root: None,
        }
    }

    pub fn with_suffixes<I, S>(mut self, suffixes: I) -> LdapResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for s in suffixes {
            self.suffixes.push(parse_dn(s.as_ref())?);
        }
        Ok(self)
    }

    /// A DN that can bind with `password` whether or not an entry exists for it.
    pub fn with_root(mut self, dn: &str, password: impl Into<String>) -> LdapResult<Self> {
        self.root = Some((parse_dn(dn)?, password.into()));
        Ok(self)
    }

    /// Add entries in order, as if a client had sent AddRequests.
    pub async fn seed<I>(&self, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, Attributes)>,
    {
        let ctx = RequestContext::new(0, None, CancellationToken::new());
        for (dn, attrs) in entries {
            self.add(&ctx, &dn, &attrs).await?;
        }
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// A copy of the entry at `dn`, if there is one.
    pub async fn get(&self, dn: &str) -> Option<Attributes> {
        let rdns = parse_dn(dn).ok()?;
        self.entries.read().await.get(&key(&rdns)).map(|e| e.attrs.clone())
    }

    fn check_entry(&self, rdns: &[Rdn], attrs: Attributes) -> LdapResult<Attributes> {
        let attrs = match &self.schema {
            Some(schema) => schema.validate_entry(&attrs)?,
            None => attrs,
        };
        if let Some(rdn) = rdns.first() {
            for (attr, value) in rdn {
                let present = match &self.schema {
                    Some(schema) => {
                        let name = schema.find_attribute_type(attr)?.name().to_string();
                        has_value(&attrs, &name, value)
                    }
                    None => has_value(&attrs, attr, value),
                };
                if !present {
                    return Err(LdapError::new(
                        ResultCode::NamingViolation,
                        format!("naming attribute '{}' is not present in entry", attr),
                    ));
                }
            }
        }
        Ok(attrs)
    }

    fn parent_exists(&self, entries: &BTreeMap<String, StoredEntry>, rdns: &[Rdn]) -> bool {
        if rdns.is_empty() {
            return false;
        }
        let parent = &rdns[1..];
        (parent.is_empty() && self.suffixes.is_empty())
            || self.suffixes.iter().any(|s| s == rdns)
            || entries.contains_key(&key(parent))
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn simple_bind(&self, _ctx: &RequestContext, version: i32, dn: &str, password: &str) -> Result<()> {
        if version != 3 {
            return Err(LdapError::protocol("version 3 only").into());
        }
        if dn.is_empty() {
            return Ok(());
        }
        if password.is_empty() {
            return Err(LdapError::unwilling("unauthenticated bind not allowed").into());
        }
        let rdns = parse_dn(dn)?;
        if let Some((root, root_password)) = &self.root {
            if *root == rdns && root_password == password {
                return Ok(());
            }
        }
        let entries = self.entries.read().await;
        let ok = entries
            .get(&key(&rdns))
            .and_then(|e| get_values(&e.attrs, "userPassword"))
            .map(|pw| pw.iter().any(|p| p == password))
            .unwrap_or(false);
        if ok {
            Ok(())
        } else {
            Err(LdapError::from(ResultCode::InvalidCredentials).into())
        }
    }

    async fn search(
        &self,
        ctx: &RequestContext,
        base: &str,
        scope: SearchScope,
        _deref: DerefAliases,
        filter: &Filter,
        sink: &mut SearchSink,
    ) -> Result<()> {
        let base = parse_dn(base)?;
        let matches: Vec<(String, Attributes)> = {
            let entries = self.entries.read().await;
            if !base.is_empty() && !entries.contains_key(&key(&base)) {
                return Err(LdapError::no_such_object(&join_dn(&base)).into());
            }
            entries
                .values()
                .filter(|e| e.in_scope(&base, scope))
                .filter(|e| filter.eval(&e.attrs).is_true())
                .map(|e| (e.dn.clone(), e.attrs.clone()))
                .collect()
        };
        debug!("search matched {} entries", matches.len());
        for (dn, attrs) in matches {
            ctx.check()?;
            sink.send_entry(&dn, &attrs).await?;
        }
        Ok(())
    }

    async fn add(&self, _ctx: &RequestContext, dn: &str, attrs: &Attributes) -> Result<()> {
        let rdns = parse_dn(dn)?;
        if rdns.is_empty() {
            return Err(LdapError::unwilling("cannot add the root DSE").into());
        }
        let attrs = self.check_entry(&rdns, attrs.clone())?;
        let mut entries = self.entries.write().await;
        let k = key(&rdns);
        if entries.contains_key(&k) {
            return Err(LdapError::from(ResultCode::EntryAlreadyExists).into());
        }
        if !self.parent_exists(&entries, &rdns) {
            return Err(LdapError::no_such_object(&join_dn(&rdns[1..])).into());
        }
        entries.insert(
            k,
            StoredEntry {
                dn: dn.trim().to_string(),
                rdns,
                attrs,
            },
        );
        Ok(())
    }

    async fn delete(&self, _ctx: &RequestContext, dn: &str) -> Result<()> {
        let rdns = parse_dn(dn)?;
        let mut entries = self.entries.write().await;
        let k = key(&rdns);
        if !entries.contains_key(&k) {
            return Err(LdapError::no_such_object(dn).into());
        }
        if entries.values().any(|e| e.rdns.len() > rdns.len() && e.is_under(&rdns)) {
            return Err(LdapError::from(ResultCode::NotAllowedOnNonLeaf).into());
        }
        entries.remove(&k);
        Ok(())
    }

    async fn modify(&self, _ctx: &RequestContext, dn: &str, mods: &[Modification]) -> Result<()> {
        let rdns = parse_dn(dn)?;
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(&key(&rdns))
            .ok_or_else(|| LdapError::no_such_object(dn))?;
        let updated = match &self.schema {
            Some(schema) => schema.validate(mods, &entry.attrs)?,
            None => {
                let mut attrs = entry.attrs.clone();
                for m in mods {
                    let existing = attrs.keys().find(|k| k.eq_ignore_ascii_case(&m.attr)).cloned();
                    let mut vals = existing.and_then(|k| attrs.remove(&k)).unwrap_or_default();
                    apply_values(&mut vals, m.op, &m.values);
                    if !vals.is_empty() {
                        attrs.insert(m.attr.clone(), vals);
                    }
                }
                attrs
            }
        };
        if let Some(rdn) = rdns.first() {
            for (attr, value) in rdn {
                let name = match &self.schema {
                    Some(schema) => schema.find_attribute_type(attr)?.name().to_string(),
                    None => attr.clone(),
                };
                if !has_value(&updated, &name, value) {
                    return Err(LdapError::new(
                        ResultCode::NotAllowedOnRdn,
                        format!("cannot remove naming attribute '{}'", attr),
                    )
                    .into());
                }
            }
        }
        entry.attrs = updated;
        Ok(())
    }

    async fn modify_dn(
        &self,
        _ctx: &RequestContext,
        dn: &str,
        new_rdn: &str,
        delete_old_rdn: bool,
        new_superior: Option<&str>,
    ) -> Result<()> {
        let rdns = parse_dn(dn)?;
        let raw_rdn = split_dn(new_rdn).map_err(|e| LdapError::new(ResultCode::InvalidDnSyntax, e.message))?;
        let [raw_rdn]: [Rdn; 1] = raw_rdn
            .try_into()
            .map_err(|_| LdapError::new(ResultCode::InvalidDnSyntax, "newrdn must be a single RDN"))?;
        let folded_rdn = fold(vec![raw_rdn.clone()]).remove(0);

        let mut entries = self.entries.write().await;
        let old_key = key(&rdns);
        let entry = entries.get(&old_key).cloned().ok_or_else(|| LdapError::no_such_object(dn))?;

        let (parent_rdns, parent_dn) = match new_superior {
            Some(sup) => (parse_dn(sup)?, sup.trim().to_string()),
            None => {
                let parent = rdns[1..].to_vec();
                let shown = split_keep_escapes(&entry.dn).get(1..).map(|p| p.join(",")).unwrap_or_default();
                (parent, shown)
            }
        };
        if !parent_rdns.is_empty() && !entries.contains_key(&key(&parent_rdns)) {
            return Err(LdapError::no_such_object(&parent_dn).into());
        }
        let mut new_rdns = vec![folded_rdn.clone()];
        new_rdns.extend(parent_rdns.iter().cloned());
        let new_key = key(&new_rdns);
        if new_key != old_key && entries.contains_key(&new_key) {
            return Err(LdapError::from(ResultCode::EntryAlreadyExists).into());
        }
        if new_rdns.len() > rdns.len() && new_rdns[new_rdns.len() - rdns.len()..] == *rdns {
            return Err(LdapError::unwilling("cannot move an entry below itself").into());
        }

        let mut mods: Vec<Modification> = raw_rdn
            .iter()
            .map(|(a, v)| Modification::new(ModifyOperation::Add, a.clone(), vec![v.clone()]))
            .collect();
        if delete_old_rdn {
            for (attr, value) in &rdns[0] {
                if folded_rdn.iter().any(|(a, v)| a == attr && v == value) {
                    continue;
                }
                let actual: Vec<String> = get_values(&entry.attrs, attr)
                    .map(|vals| vals.iter().filter(|v| v.trim().eq_ignore_ascii_case(value)).cloned().collect())
                    .unwrap_or_default();
                if !actual.is_empty() {
                    mods.push(Modification::delete(attr.clone(), actual));
                }
            }
        }
        let attrs = match &self.schema {
            Some(schema) => schema.validate(&mods, &entry.attrs)?,
            None => {
                let mut attrs = entry.attrs.clone();
                for m in &mods {
                    let k = attrs.keys().find(|k| k.eq_ignore_ascii_case(&m.attr)).cloned();
                    let mut vals = k.and_then(|k| attrs.remove(&k)).unwrap_or_default();
                    // RDN values are compared case-insensitively
                    if m.op == ModifyOperation::Add && vals.iter().any(|v| m.values.iter().any(|n| n.eq_ignore_ascii_case(v))) {
                        attrs.insert(m.attr.clone(), vals);
                        continue;
                    }
                    apply_values(&mut vals, m.op, &m.values);
                    if !vals.is_empty() {
                        attrs.insert(m.attr.clone(), vals);
                    }
                }
                attrs
            }
        };

        let new_dn = if parent_dn.is_empty() {
            new_rdn.trim().to_string()
        } else {
            format!("{},{}", new_rdn.trim(), parent_dn)
        };

        // move the entry and everything under it
        let moved: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.is_under(&rdns))
            .map(|(k, _)| k.clone())
            .collect();
        for k in moved {
            let Some(mut e) = entries.remove(&k) else { continue };
            let depth = e.rdns.len() - rdns.len();
            let mut moved_rdns = e.rdns[..depth].to_vec();
            moved_rdns.extend(new_rdns.iter().cloned());
            if depth == 0 {
                e.dn = new_dn.clone();
                e.attrs = attrs.clone();
            } else {
                let shown: Vec<&str> = split_keep_escapes(&e.dn).into_iter().take(depth).collect();
                e.dn = format!("{},{}", shown.join(","), new_dn);
            }
            e.rdns = moved_rdns;
            entries.insert(key(&e.rdns), e);
        }
        Ok(())
    }

    async fn compare(&self, _ctx: &RequestContext, dn: &str, attr: &str, value: &str) -> Result<bool> {
        let rdns = parse_dn(dn)?;
        let entries = self.entries.read().await;
        let entry = entries.get(&key(&rdns)).ok_or_else(|| LdapError::no_such_object(dn))?;
        let (name, rule) = match &self.schema {
            Some(schema) => {
                let at = schema.find_attribute_type(attr)?;
                let rule = at.equality_rule().cloned().ok_or_else(|| {
                    LdapError::new(
                        ResultCode::InappropriateMatching,
                        format!("no equality matching rule for {}", at.name()),
                    )
                })?;
                (at.name().to_string(), Some(rule))
            }
            None => (attr.to_string(), None),
        };
        let values = get_values(&entry.attrs, &name)
            .ok_or_else(|| LdapError::new(ResultCode::NoSuchAttribute, format!("no {} in entry", name)))?;
        Ok(match rule {
            Some(rule) => rule.equality_match(values, value).unwrap_or(false),
            None => values.iter().any(|v| v == value),
        })
    }
}

/// Split a stored DN into its RDN strings without unescaping them.
fn split_keep_escapes(dn: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut escaped = false;
    for (i, c) in dn.char_indices() {
        match c {
            '\\' if !escaped => escaped = true,
            ',' | ';' if !escaped => {
                parts.push(dn[start..i].trim());
                start = i + 1;
            }
            _ => escaped = false,
        }
    }
    parts.push(dn[start..].trim());
    parts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::RecordingWriter;
    use crate::backend::AttributeSelection;
    use crate::ldap_protocol::{RawFilter, Response};
    use crate::schema::testdata::person_schema;

    fn attrs(pairs: &[(&str, &[&str])]) -> Attributes {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.iter().map(|s| s.to_string()).collect()))
            .collect()
    }

    fn ctx() -> RequestContext {
        RequestContext::new(1, None, CancellationToken::new())
    }

    fn code(err: &anyhow::Error) -> Option<ResultCode> {
        err.downcast_ref::<LdapError>().map(|e| e.code)
    }

    async fn directory(schema: Option<Arc<Schema>>) -> MemoryBackend {
        let b = MemoryBackend::new(schema)
            .with_suffixes(["dc=example,dc=com"])
            .unwrap()
            .with_root("cn=admin,dc=example,dc=com", "secret")
            .unwrap();
        b.seed(vec![
            ("dc=example,dc=com".to_string(), attrs(&[("objectClass", &["organization", "dcObject"]), ("o", &["Example"]), ("dc", &["example"])])),
            ("ou=People,dc=example,dc=com".to_string(), attrs(&[("objectClass", &["organizationalUnit"]), ("ou", &["People"])])),
            (
                "cn=Fred,ou=People,dc=example,dc=com".to_string(),
                attrs(&[("objectClass", &["person"]), ("cn", &["Fred"]), ("sn", &["Bloggs"]), ("userPassword", &["pw"])]),
            ),
            (
                "cn=Joe,ou=People,dc=example,dc=com".to_string(),
                attrs(&[("objectClass", &["person"]), ("cn", &["Joe"]), ("sn", &["Smith"])]),
            ),
        ])
        .await
        .unwrap();
        b
    }

    async fn search(b: &MemoryBackend, base: &str, scope: SearchScope, filter: Filter) -> Result<Vec<String>> {
        let writer = Arc::new(RecordingWriter::default());
        let mut sink = SearchSink::new(1, writer.clone(), AttributeSelection::new(&[], false, None), None, CancellationToken::new());
        b.search(&ctx(), base, scope, DerefAliases::Never, &filter, &mut sink).await?;
        let responses = writer.responses.lock().await;
        Ok(responses
            .iter()
            .filter_map(|(_, r)| match r {
                Response::SearchEntry { dn, .. } => Some(dn.clone()),
                _ => None,
            })
            .collect())
    }

    #[tokio::test]
    async fn test_scopes() {
        let b = directory(None).await;
        let all = search(&b, "dc=example,dc=com", SearchScope::WholeSubtree, Filter::True).await.unwrap();
        assert_eq!(all.len(), 4);
        let one = search(&b, "OU=people,DC=Example,DC=com", SearchScope::SingleLevel, Filter::True).await.unwrap();
        assert_eq!(one.len(), 2);
        let base = search(&b, "ou=People,dc=example,dc=com", SearchScope::BaseObject, Filter::True).await.unwrap();
        assert_eq!(base, vec!["ou=People,dc=example,dc=com"]);
        let everything = search(&b, "", SearchScope::WholeSubtree, Filter::True).await.unwrap();
        assert_eq!(everything.len(), 4);

        let err = search(&b, "ou=Nowhere,dc=example,dc=com", SearchScope::BaseObject, Filter::True)
            .await
            .unwrap_err();
        assert_eq!(code(&err), Some(ResultCode::NoSuchObject));
    }

    #[tokio::test]
    async fn test_search_filter_with_schema() {
        let schema = Arc::new(person_schema());
        let b = directory(Some(schema.clone())).await;
        let f = Filter::parse(&RawFilter::EqualityMatch("surname".into(), "SMITH".into()), Some(&schema));
        let found = search(&b, "dc=example,dc=com", SearchScope::WholeSubtree, f).await.unwrap();
        assert_eq!(found, vec!["cn=Joe,ou=People,dc=example,dc=com"]);
    }

    #[tokio::test]
    async fn test_add_rules() {
        let b = directory(None).await;
        let entry = attrs(&[("objectClass", &["person"]), ("cn", &["Ann"]), ("sn", &["X"])]);
        let err = b.add(&ctx(), "cn=Ann,ou=Missing,dc=example,dc=com", &entry).await.unwrap_err();
        assert_eq!(code(&err), Some(ResultCode::NoSuchObject));
        b.add(&ctx(), "cn=Ann,ou=People,dc=example,dc=com", &entry).await.unwrap();
        let err = b.add(&ctx(), "CN=ann,ou=people,dc=example,dc=com", &entry).await.unwrap_err();
        assert_eq!(code(&err), Some(ResultCode::EntryAlreadyExists));
        let err = b.add(&ctx(), "cn=Bob,ou=People,dc=example,dc=com", &entry).await.unwrap_err();
        assert_eq!(code(&err), Some(ResultCode::NamingViolation));
        let err = b.add(&ctx(), "dc=other,dc=org", &attrs(&[("dc", &["other"])])).await.unwrap_err();
        assert_eq!(code(&err), Some(ResultCode::NoSuchObject));
        let err = b.add(&ctx(), "not a dn", &entry).await.unwrap_err();
        assert_eq!(code(&err), Some(ResultCode::InvalidDnSyntax));
    }

    #[tokio::test]
    async fn test_add_validates_with_schema() {
        let b = directory(Some(Arc::new(person_schema()))).await;
        let err = b
            .add(&ctx(), "cn=Ann,ou=People,dc=example,dc=com", &attrs(&[("objectClass", &["person"]), ("cn", &["Ann"])]))
            .await
            .unwrap_err();
        assert_eq!(code(&err), Some(ResultCode::ObjectClassViolation));
        let stored = b.get("cn=Fred,ou=People,dc=example,dc=com").await.unwrap();
        assert_eq!(stored["objectClass"], vec!["person", "top"]);
    }

    #[tokio::test]
    async fn test_delete() {
        let b = directory(None).await;
        let err = b.delete(&ctx(), "ou=People,dc=example,dc=com").await.unwrap_err();
        assert_eq!(code(&err), Some(ResultCode::NotAllowedOnNonLeaf));
        b.delete(&ctx(), "cn=Fred,ou=People,dc=example,dc=com").await.unwrap();
        let err = b.delete(&ctx(), "cn=Fred,ou=People,dc=example,dc=com").await.unwrap_err();
        assert_eq!(code(&err), Some(ResultCode::NoSuchObject));
        assert_eq!(b.len().await, 3);
    }

    #[tokio::test]
    async fn test_modify() {
        let b = directory(Some(Arc::new(person_schema()))).await;
        let dn = "cn=Fred,ou=People,dc=example,dc=com";
        b.modify(&ctx(), dn, &[Modification::add("description", vec!["hello".into()])]).await.unwrap();
        assert_eq!(b.get(dn).await.unwrap()["description"], vec!["hello"]);

        let err = b.modify(&ctx(), dn, &[Modification::delete("sn", vec![])]).await.unwrap_err();
        assert_eq!(code(&err), Some(ResultCode::ObjectClassViolation));
        let err = b
            .modify(&ctx(), dn, &[Modification::replace("cn", vec!["Freddy".into()])])
            .await
            .unwrap_err();
        assert_eq!(code(&err), Some(ResultCode::NotAllowedOnRdn));
        let err = b.modify(&ctx(), "cn=Nobody,dc=example,dc=com", &[]).await.unwrap_err();
        assert_eq!(code(&err), Some(ResultCode::NoSuchObject));
    }

    #[tokio::test]
    async fn test_modify_dn() {
        let b = directory(None).await;
        b.modify_dn(&ctx(), "cn=Fred,ou=People,dc=example,dc=com", "cn=Frederick", true, None)
            .await
            .unwrap();
        assert!(b.get("cn=Fred,ou=People,dc=example,dc=com").await.is_none());
        let moved = b.get("cn=Frederick,ou=People,dc=example,dc=com").await.unwrap();
        assert_eq!(moved["cn"], vec!["Frederick"]);

        let err = b
            .modify_dn(&ctx(), "cn=Joe,ou=People,dc=example,dc=com", "cn=Frederick", false, None)
            .await
            .unwrap_err();
        assert_eq!(code(&err), Some(ResultCode::EntryAlreadyExists));

        b.modify_dn(&ctx(), "cn=Joe,ou=People,dc=example,dc=com", "cn=Joseph", false, Some("dc=example,dc=com"))
            .await
            .unwrap();
        let joe = b.get("cn=Joseph,dc=example,dc=com").await.unwrap();
        assert_eq!(joe["cn"], vec!["Joe", "Joseph"]);
    }

    #[tokio::test]
    async fn test_modify_dn_moves_subtree() {
        let b = directory(None).await;
        b.modify_dn(&ctx(), "ou=People,dc=example,dc=com", "ou=Staff", true, None)
            .await
            .unwrap();
        let found = search(&b, "ou=Staff,dc=example,dc=com", SearchScope::SingleLevel, Filter::True)
            .await
            .unwrap();
        assert_eq!(
            found,
            vec!["cn=Fred,ou=Staff,dc=example,dc=com", "cn=Joe,ou=Staff,dc=example,dc=com"]
        );
        let err = b
            .modify_dn(&ctx(), "dc=example,dc=com", "dc=x", false, Some("ou=Staff,dc=example,dc=com"))
            .await
            .unwrap_err();
        assert_eq!(code(&err), Some(ResultCode::UnwillingToPerform));
    }

    #[tokio::test]
    async fn test_compare() {
        let schema = Arc::new(person_schema());
        let b = directory(Some(schema)).await;
        let dn = "cn=Fred,ou=People,dc=example,dc=com";
        assert!(b.compare(&ctx(), dn, "sn", "BLOGGS").await.unwrap());
        assert!(!b.compare(&ctx(), dn, "surname", "Smith").await.unwrap());
        let err = b.compare(&ctx(), dn, "description", "x").await.unwrap_err();
        assert_eq!(code(&err), Some(ResultCode::NoSuchAttribute));
        let err = b.compare(&ctx(), dn, "bogus", "x").await.unwrap_err();
        assert_eq!(code(&err), Some(ResultCode::UndefinedAttributeType));
    }

    #[tokio::test]
    async fn test_bind() {
        let b = directory(None).await;
        assert!(b.simple_bind(&ctx(), 3, "", "").await.is_ok());
        assert!(b.simple_bind(&ctx(), 3, "cn=admin,dc=example,dc=com", "secret").await.is_ok());
        assert!(b.simple_bind(&ctx(), 3, "cn=Fred,ou=People,dc=example,dc=com", "pw").await.is_ok());
        let err = b.simple_bind(&ctx(), 3, "cn=Fred,ou=People,dc=example,dc=com", "nope").await.unwrap_err();
        assert_eq!(code(&err), Some(ResultCode::InvalidCredentials));
        let err = b.simple_bind(&ctx(), 3, "cn=Joe,ou=People,dc=example,dc=com", "x").await.unwrap_err();
        assert_eq!(code(&err), Some(ResultCode::InvalidCredentials));
        let err = b.simple_bind(&ctx(), 3, "cn=Fred,ou=People,dc=example,dc=com", "").await.unwrap_err();
        assert_eq!(code(&err), Some(ResultCode::UnwillingToPerform));
        let err = b.simple_bind(&ctx(), 2, "", "").await.unwrap_err();
        assert_eq!(code(&err), Some(ResultCode::ProtocolError));
    }

    #[test]
    fn test_split_keep_escapes() {
        assert_eq!(split_keep_escapes("cn=a\\,b, o=x;c=y"), vec!["cn=a\\,b", "o=x", "c=y"]);
    }
}
