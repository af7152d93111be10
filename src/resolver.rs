//! Name to id resolution for servers and settings.
//!
//! Callers may address servers and settings by name. Before a packet can be
//! sent every name must be replaced by the id the manager assigned to it.
//! [`NameResolver`] keeps the answers in a cache for the life of the
//! connection, so only the first use of a name costs a lookup round trip.
//!
//! The cache is never invalidated: a server restarting under a new id while
//! the connection is open is not noticed.
use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
};

use log::debug;

use crate::{
    ConnectionError,
    data::Data,
    protocol::{LOOKUP_SETTING, MANAGER_ID, Record, Requester, Setting, Target, WireRecord},
};

#[derive(Debug, Default)]
struct LookupCache {
    servers: HashMap<String, u32>,
    settings: HashMap<u32, HashMap<String, u32>>,
}

#[derive(Debug, Default)]
pub struct NameResolver {
    cache: Mutex<LookupCache>,
}

impl NameResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces every name in `target` and `records` by its id.
    ///
    /// Anything not already cached is fetched with a single lookup request.
    pub(crate) fn resolve<R>(
        &self,
        requester: &R,
        target: Target,
        records: Vec<Record>,
    ) -> Result<(u32, Vec<WireRecord>), ConnectionError>
    where
        R: Requester + ?Sized,
    {
        let (server, mut ids) = {
            let cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
            let server = match &target {
                Target::Id(id) => Some(*id),
                Target::Name(name) => cache.servers.get(name).copied(),
            };
            let known = server.and_then(|id| cache.settings.get(&id));
            let ids: Vec<Option<u32>> = records
                .iter()
                .map(|record| match &record.setting {
                    Setting::Id(id) => Some(*id),
                    Setting::Name(name) => known.and_then(|s| s.get(name).copied()),
                })
                .collect();
            (server, ids)
        };

        let (missing, names): (Vec<usize>, Vec<String>) = records
            .iter()
            .zip(&ids)
            .enumerate()
            .filter_map(|(index, (record, id))| match (&record.setting, id) {
                (Setting::Name(name), None) => Some((index, name.clone())),
                _ => None,
            })
            .unzip();

        let server = match server {
            Some(id) if names.is_empty() => id,
            _ => {
                let (server, resolved) = self.lookup(requester, &target, server, names)?;
                for (index, id) in missing.into_iter().zip(resolved) {
                    ids[index] = Some(id);
                }
                server
            }
        };

        let records = records
            .into_iter()
            .zip(ids)
            .map(|(record, id)| {
                id.map(|id| WireRecord::new(id, record.data, record.tag))
                    .ok_or_else(|| {
                        ConnectionError::MalformedReply("setting left unresolved".to_string())
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok((server, records))
    }

    fn lookup<R>(
        &self,
        requester: &R,
        target: &Target,
        server: Option<u32>,
        names: Vec<String>,
    ) -> Result<(u32, Vec<u32>), ConnectionError>
    where
        R: Requester + ?Sized,
    {
        let key = match (server, target) {
            (Some(id), _) => Data::Word(id),
            (None, Target::Id(id)) => Data::Word(*id),
            (None, Target::Name(name)) => Data::Str(name.clone()),
        };
        debug!("looking up server {target} settings {names:?}");

        let query = Data::Cluster(vec![
            key,
            Data::List(names.iter().cloned().map(Data::Str).collect()),
        ]);
        let reply = requester.request(
            MANAGER_ID,
            vec![WireRecord::new(LOOKUP_SETTING, query, None)],
        )?;
        let (server, ids) = parse_lookup_reply(&reply, names.len())?;

        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if let Target::Name(name) = target {
            cache.servers.insert(name.clone(), server);
        }
        cache
            .settings
            .entry(server)
            .or_default()
            .extend(names.into_iter().zip(ids.iter().copied()));

        Ok((server, ids))
    }

    /// Forgets everything, used when a backend opens a fresh socket.
    pub fn clear(&self) {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        cache.servers.clear();
        cache.settings.clear();
    }

    /// Cached id for a server name.
    pub fn server_id(&self, name: &str) -> Option<u32> {
        let cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        cache.servers.get(name).copied()
    }

    /// Cached id for a setting name on a server.
    pub fn setting_id(&self, server: u32, name: &str) -> Option<u32> {
        let cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        cache.settings.get(&server)?.get(name).copied()
    }
}

/// Expects `(server id, [setting id, ...])` with one id per requested name.
fn parse_lookup_reply(
    records: &[WireRecord],
    expected: usize,
) -> Result<(u32, Vec<u32>), ConnectionError> {
    let malformed = || ConnectionError::MalformedReply("unexpected lookup reply".to_string());

    let fields = records
        .first()
        .and_then(|r| r.data.as_cluster())
        .ok_or_else(malformed)?;
    let [server, ids] = fields else {
        return Err(malformed());
    };

    let server = server.as_word().ok_or_else(malformed)?;
    let ids = ids
        .as_list()
        .ok_or_else(malformed)?
        .iter()
        .map(|id| id.as_word().ok_or_else(malformed))
        .collect::<Result<Vec<_>, _>>()?;
    if ids.len() != expected {
        return Err(ConnectionError::MalformedReply(format!(
            "lookup returned {} ids for {expected} names",
            ids.len()
        )));
    }
    Ok((server, ids))
}
