//! Room state resolution, second revision.
//!
//! Given the states reachable from several forward extremities that disagree
//! on some `(type, state_key)` slots, compute the one state every server
//! arrives at independently. The ordering rules here are interop-critical:
//! power events are applied in reverse topological power order, the rest in
//! mainline order, and every event is re-checked against the evolving state
//! as it is applied.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;

use moka::future::Cache;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use lattica_entity::types::{Event, Membership, RoomVersion, StateKey, StateMap};
use lattica_store::EventStore;

use crate::config::CacheConfig;
use crate::federation::authorization::{self, auth_types_for_event};

#[derive(Debug, Error)]
pub enum StateResolutionError {
    #[error("event {0} referenced during resolution is not available")]
    MissingEvent(String),
    #[error("storage failure: {0}")]
    Store(#[from] lattica_store::StoreError),
}

/// Resolve `state_sets` into a single state map.
///
/// `auth_chains` holds, per state set, the full auth chain of that set's
/// events. `event_map` must contain every event mentioned in the state sets
/// and chains; resolution is otherwise pure.
pub fn resolve(
    room_version: &RoomVersion,
    state_sets: &[StateMap<String>],
    auth_chains: &[HashSet<String>],
    event_map: &HashMap<String, Event>,
) -> Result<StateMap<String>, StateResolutionError> {
    match state_sets.len() {
        0 => return Ok(StateMap::new()),
        1 => return Ok(state_sets[0].clone()),
        _ => {},
    }

    let (unconflicted, conflicted) = separate(state_sets);
    if conflicted.is_empty() {
        return Ok(unconflicted);
    }

    let auth_difference = auth_chain_difference(auth_chains);

    let mut full_conflicted_set: HashSet<String> = auth_difference;
    for ids in conflicted.values() {
        full_conflicted_set.extend(ids.iter().cloned());
    }
    // Events we cannot inspect cannot be ordered; drop them from the
    // contested set rather than failing the whole resolution.
    full_conflicted_set.retain(|id| event_map.contains_key(id));

    debug!(
        conflicted_slots = conflicted.len(),
        contested_events = full_conflicted_set.len(),
        "resolving conflicted state"
    );

    let power_events: Vec<String> = full_conflicted_set
        .iter()
        .filter(|id| is_power_event(&event_map[*id]))
        .cloned()
        .collect();

    let sorted_power = reverse_topological_power_sort(
        room_version,
        &power_events,
        event_map,
        &full_conflicted_set,
    );

    let mut resolved = iterative_auth_checks(
        room_version,
        &sorted_power,
        unconflicted.clone(),
        event_map,
    );

    let leftover: Vec<String> = {
        let applied: HashSet<&String> = sorted_power.iter().collect();
        full_conflicted_set
            .iter()
            .filter(|id| !applied.contains(*id))
            .cloned()
            .collect()
    };

    let resolved_power_id = resolved.get(&StateKey::for_type("m.room.power_levels")).cloned();
    let sorted_leftover =
        mainline_sort(&leftover, resolved_power_id.as_deref(), event_map);

    resolved = iterative_auth_checks(room_version, &sorted_leftover, resolved, event_map);

    // Unconflicted slots always win over anything resolution produced.
    for (key, event_id) in unconflicted {
        resolved.insert(key, event_id);
    }

    Ok(resolved)
}

/// Split the state sets into slots every set agrees on and slots they
/// contest. Conflicted slots map to every distinct candidate, including an
/// absent entry counting as a distinct candidate.
fn separate(
    state_sets: &[StateMap<String>],
) -> (StateMap<String>, HashMap<StateKey, HashSet<String>>) {
    let mut all_keys: HashSet<&StateKey> = HashSet::new();
    for set in state_sets {
        all_keys.extend(set.keys());
    }

    let mut unconflicted = StateMap::new();
    let mut conflicted: HashMap<StateKey, HashSet<String>> = HashMap::new();

    for key in all_keys {
        let mut candidates: HashSet<Option<&String>> =
            state_sets.iter().map(|set| set.get(key)).collect();

        if candidates.len() == 1 {
            if let Some(Some(event_id)) = candidates.drain().next() {
                unconflicted.insert(key.clone(), event_id.clone());
            }
        } else {
            conflicted.insert(
                key.clone(),
                candidates.into_iter().flatten().cloned().collect(),
            );
        }
    }

    (unconflicted, conflicted)
}

/// Events in some auth chains but not all of them.
fn auth_chain_difference(auth_chains: &[HashSet<String>]) -> HashSet<String> {
    let mut iter = auth_chains.iter();
    let first = match iter.next() {
        Some(first) => first,
        None => return HashSet::new(),
    };

    let mut union = first.clone();
    let mut intersection = first.clone();
    for chain in iter {
        union.extend(chain.iter().cloned());
        intersection.retain(|id| chain.contains(id));
    }

    union.retain(|id| !intersection.contains(id));
    union
}

/// Whether an event can change who is allowed to do what: power levels, join
/// rules, and membership events that act against another user.
fn is_power_event(event: &Event) -> bool {
    match event.event_type.as_str() {
        "m.room.power_levels" | "m.room.join_rules" => {
            event.state_key.as_deref() == Some("")
        },
        "m.room.member" => {
            matches!(event.membership(), Some(Membership::Leave) | Some(Membership::Ban))
                && event.state_key.as_deref() != Some(event.sender.as_str())
        },
        _ => false,
    }
}

#[derive(PartialEq, Eq)]
struct PowerOrderKey {
    negated_power: i64,
    origin_server_ts: i64,
    event_id: String,
}

impl Ord for PowerOrderKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.negated_power, self.origin_server_ts, &self.event_id).cmp(&(
            other.negated_power,
            other.origin_server_ts,
            &other.event_id,
        ))
    }
}

impl PartialOrd for PowerOrderKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Order `event_ids` plus their auth ancestors inside `allowed` so that
/// ancestors come first, breaking ties by sender power descending, timestamp
/// ascending, then event id.
fn reverse_topological_power_sort(
    room_version: &RoomVersion,
    event_ids: &[String],
    event_map: &HashMap<String, Event>,
    allowed: &HashSet<String>,
) -> Vec<String> {
    // graph: event -> auth ancestors it waits on.
    let mut graph: HashMap<String, HashSet<String>> = HashMap::new();
    let mut stack: Vec<String> = event_ids.to_vec();
    while let Some(event_id) = stack.pop() {
        if graph.contains_key(&event_id) {
            continue;
        }
        let deps: HashSet<String> = event_map
            .get(&event_id)
            .map(|event| {
                event
                    .auth_event_ids()
                    .iter()
                    .filter(|aid| allowed.contains(*aid))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        stack.extend(deps.iter().cloned());
        graph.insert(event_id, deps);
    }

    let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
    for (event_id, deps) in &graph {
        for dep in deps {
            dependents.entry(dep.clone()).or_default().push(event_id.clone());
        }
    }

    let order_key = |event_id: &str| -> PowerOrderKey {
        let event = &event_map[event_id];
        PowerOrderKey {
            negated_power: -sender_power_at(room_version, event, event_map),
            origin_server_ts: event.origin_server_ts,
            event_id: event_id.to_string(),
        }
    };

    let mut outstanding: HashMap<String, usize> =
        graph.iter().map(|(id, deps)| (id.clone(), deps.len())).collect();

    let mut ready: BinaryHeap<Reverse<PowerOrderKey>> = outstanding
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(id, _)| Reverse(order_key(id)))
        .collect();

    let mut sorted = Vec::with_capacity(graph.len());
    while let Some(Reverse(key)) = ready.pop() {
        let event_id = key.event_id;
        for dependent in dependents.get(&event_id).into_iter().flatten() {
            let count = outstanding.get_mut(dependent).expect("dependent is in graph");
            *count -= 1;
            if *count == 0 {
                ready.push(Reverse(order_key(dependent)));
            }
        }
        sorted.push(event_id);
    }

    sorted
}

/// Power level of an event's sender at the time it was sent, taken from the
/// power-levels event in its own auth events.
fn sender_power_at(
    room_version: &RoomVersion,
    event: &Event,
    event_map: &HashMap<String, Event>,
) -> i64 {
    let mut auth_state: StateMap<Event> = StateMap::new();
    for auth_id in event.auth_event_ids() {
        if let Some(auth_event) = event_map.get(auth_id) {
            match auth_event.event_type.as_str() {
                "m.room.power_levels" | "m.room.create" => {
                    if let Some(pair) = auth_event.state_key_pair() {
                        auth_state.insert(pair, auth_event.clone());
                    }
                },
                _ => {},
            }
        }
    }
    authorization::user_power_level(room_version, &event.sender, &auth_state)
}

/// Apply `order` to `base_state` one event at a time, re-checking each event
/// against the state built so far. Events failing the check are dropped from
/// the result but stay in the room's history.
fn iterative_auth_checks(
    room_version: &RoomVersion,
    order: &[String],
    base_state: StateMap<String>,
    event_map: &HashMap<String, Event>,
) -> StateMap<String> {
    let mut resolved = base_state;

    for event_id in order {
        let event = match event_map.get(event_id) {
            Some(event) => event,
            None => continue,
        };

        let mut auth_state: StateMap<Event> = StateMap::new();
        for auth_id in event.auth_event_ids() {
            if let Some(auth_event) = event_map.get(auth_id) {
                if auth_event.is_rejected() {
                    continue;
                }
                if let Some(pair) = auth_event.state_key_pair() {
                    auth_state.insert(pair, auth_event.clone());
                }
            }
        }

        // The resolved-so-far state overrides the event's own claims.
        for key in auth_types_for_event(room_version, event) {
            if let Some(resolved_id) = resolved.get(&key) {
                if let Some(resolved_event) = event_map.get(resolved_id) {
                    auth_state.insert(key, resolved_event.clone());
                }
            }
        }

        match authorization::check(room_version, event, &auth_state, false) {
            Ok(()) => {
                if let Some(pair) = event.state_key_pair() {
                    resolved.insert(pair, event_id.clone());
                }
            },
            Err(reason) => {
                debug!(event_id = %event_id, %reason, "event lost iterative auth check");
            },
        }
    }

    resolved
}

/// Sort events by how close their ancestry sits to the resolved power-levels
/// mainline, then timestamp, then event id.
fn mainline_sort(
    event_ids: &[String],
    resolved_power_id: Option<&str>,
    event_map: &HashMap<String, Event>,
) -> Vec<String> {
    // The mainline is the chain of power-levels events reachable by always
    // following the power-levels auth edge, oldest first.
    let mut mainline: Vec<String> = Vec::new();
    let mut cursor = resolved_power_id.map(str::to_string);
    while let Some(power_id) = cursor.take() {
        mainline.push(power_id.clone());
        if let Some(power_event) = event_map.get(&power_id) {
            cursor = power_event
                .auth_event_ids()
                .iter()
                .find(|aid| {
                    event_map.get(*aid).is_some_and(|e| {
                        e.event_type == "m.room.power_levels"
                            && e.state_key.as_deref() == Some("")
                    })
                })
                .cloned();
        }
    }
    mainline.reverse();

    let mainline_positions: HashMap<&str, usize> = mainline
        .iter()
        .enumerate()
        .map(|(position, id)| (id.as_str(), position))
        .collect();

    let mut depth_cache: HashMap<String, usize> = HashMap::new();
    let mut sortable: Vec<(usize, i64, &String)> = event_ids
        .iter()
        .map(|id| {
            let depth = mainline_depth(id, event_map, &mainline_positions, &mut depth_cache);
            let ts = event_map.get(id).map(|e| e.origin_server_ts).unwrap_or(0);
            (depth, ts, id)
        })
        .collect();

    sortable.sort();
    sortable.into_iter().map(|(_, _, id)| id.clone()).collect()
}

fn mainline_depth(
    event_id: &str,
    event_map: &HashMap<String, Event>,
    mainline_positions: &HashMap<&str, usize>,
    cache: &mut HashMap<String, usize>,
) -> usize {
    if let Some(position) = mainline_positions.get(event_id) {
        return *position;
    }
    if let Some(depth) = cache.get(event_id) {
        return *depth;
    }

    let depth = event_map
        .get(event_id)
        .and_then(|event| {
            event
                .auth_event_ids()
                .iter()
                .find(|aid| {
                    event_map.get(*aid).is_some_and(|e| {
                        e.event_type == "m.room.power_levels"
                            && e.state_key.as_deref() == Some("")
                    })
                })
                .map(|aid| mainline_depth(aid, event_map, mainline_positions, cache))
        })
        .unwrap_or(0);

    cache.insert(event_id.to_string(), depth);
    depth
}

/// Store-backed front end for [`resolve`], caching results per extremity set.
pub struct StateResolver {
    store: Arc<dyn EventStore>,
    cache: Cache<String, StateMap<String>>,
}

impl StateResolver {
    pub fn new(store: Arc<dyn EventStore>, cache_config: &CacheConfig) -> Self {
        Self {
            store,
            cache: Cache::builder()
                .max_capacity(cache_config.state_cache_capacity)
                .time_to_live(std::time::Duration::from_secs(cache_config.ttl_seconds))
                .build(),
        }
    }

    /// State of the room at the union of `event_ids`, resolving any
    /// disagreement between their individual states.
    #[instrument(skip_all, fields(room_id = %room_id))]
    pub async fn resolve_at_events(
        &self,
        room_id: &str,
        room_version: &RoomVersion,
        event_ids: &[String],
    ) -> Result<StateMap<String>, StateResolutionError> {
        let mut sorted_ids = event_ids.to_vec();
        sorted_ids.sort();
        let cache_key = format!("{room_id}|{}", sorted_ids.join(","));

        if let Some(cached) = self.cache.get(&cache_key).await {
            return Ok(cached);
        }

        let state_groups = self.store.get_state_groups_ids(room_id, event_ids).await?;
        let state_sets: Vec<StateMap<String>> = state_groups.into_values().collect();

        if state_sets.is_empty() {
            return Ok(StateMap::new());
        }

        let mut auth_chains = Vec::with_capacity(state_sets.len());
        let mut wanted: HashSet<String> = HashSet::new();
        for set in &state_sets {
            let ids: Vec<String> = set.values().cloned().collect();
            wanted.extend(ids.iter().cloned());
            let chain: HashSet<String> = self
                .store
                .get_auth_chain_ids(room_id, &ids, true)
                .await?
                .into_iter()
                .collect();
            wanted.extend(chain.iter().cloned());
            auth_chains.push(chain);
        }

        let wanted: Vec<String> = wanted.into_iter().collect();
        let event_map = self.store.get_events(&wanted).await?;
        if event_map.len() < wanted.len() {
            warn!(
                room_id = %room_id,
                missing = wanted.len() - event_map.len(),
                "resolving with incomplete auth chains"
            );
        }

        let resolved = resolve(room_version, &state_sets, &auth_chains, &event_map)?;
        self.cache.insert(cache_key, resolved.clone()).await;
        Ok(resolved)
    }
}
