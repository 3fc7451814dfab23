//! In-memory stand-in for the storage tool, speaking its scripted output
//! format closely enough for the dataset model.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use zferry_core::{CommandOutput, DatasetKind, Endpoint, Result, Zfs};

#[derive(Debug, Clone)]
struct Node {
    kind: DatasetKind,
    guid: u64,
    txg: u64,
    origin: Option<String>,
    props: BTreeMap<String, String>,
    holds: BTreeSet<String>,
    stream_size: u64,
}

#[derive(Debug, Default)]
struct State {
    datasets: BTreeMap<String, Node>,
    next_guid: u64,
    txg: u64,
}

#[derive(Debug, Default)]
pub struct FakeZfs {
    state: Mutex<State>,
    calls: Mutex<Vec<Vec<String>>>,
    pub buffering: bool,
}

type Reply = std::result::Result<String, String>;

fn dataset_part(name: &str) -> &str {
    name.split_once('@').map_or(name, |(dataset, _)| dataset)
}

fn parent_of(name: &str) -> Option<&str> {
    match name.split_once('@') {
        Some((dataset, _)) => Some(dataset),
        None => name.rsplit_once('/').map(|(parent, _)| parent),
    }
}

/// Levels between `root` and `name`, if `name` is `root` or below it.
fn depth_below(root: &str, name: &str) -> Option<u32> {
    if name == root {
        return Some(0);
    }
    let dataset = dataset_part(name);
    let snapshot_level = u32::from(name.contains('@'));
    if dataset == root {
        return Some(snapshot_level);
    }
    let rest = dataset.strip_prefix(root)?.strip_prefix('/')?;
    Some(rest.split('/').count() as u32 + snapshot_level)
}

fn not_found(name: &str) -> String {
    format!("cannot open '{name}': dataset does not exist")
}

impl State {
    fn insert(&mut self, name: &str, kind: DatasetKind, origin: Option<String>) {
        self.next_guid += 1;
        self.txg += 1;
        let node = Node {
            kind,
            guid: 1000 + self.next_guid,
            txg: self.txg,
            origin,
            props: BTreeMap::new(),
            holds: BTreeSet::new(),
            stream_size: 4096,
        };
        self.datasets.insert(name.to_string(), node);
    }

    fn node(&self, name: &str) -> std::result::Result<&Node, String> {
        self.datasets.get(name).ok_or_else(|| not_found(name))
    }

    fn ordered(&self) -> Vec<&String> {
        let mut names: Vec<&String> = self.datasets.keys().collect();
        names.sort_by_key(|name| {
            let name: &String = *name;
            let node = &self.datasets[name];
            (
                dataset_part(name).split('/').collect::<Vec<_>>(),
                node.kind.is_snapshot(),
                node.txg,
            )
        });
        names
    }

    fn clones_of(&self, snapshot: &str) -> Vec<String> {
        self.datasets
            .iter()
            .filter(|(_, node)| node.origin.as_deref() == Some(snapshot))
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn below(&self, root: &str) -> Vec<String> {
        self.datasets
            .keys()
            .filter(|name| name.as_str() != root && depth_below(root, name).is_some())
            .cloned()
            .collect()
    }

    fn property(&self, name: &str, node: &Node, prop: &str) -> Option<(String, String)> {
        let builtin = |value: String| Some((value, "-".to_string()));
        match prop {
            "type" => builtin(node.kind.as_str().to_string()),
            "name" => builtin(name.to_string()),
            "guid" => builtin(node.guid.to_string()),
            "createtxg" => builtin(node.txg.to_string()),
            "origin" => builtin(node.origin.clone().unwrap_or_else(|| "-".to_string())),
            "clones" if node.kind.is_snapshot() => builtin(self.clones_of(name).join(",")),
            "clones" => builtin("-".to_string()),
            other => node
                .props
                .get(other)
                .map(|value| (value.clone(), "local".to_string())),
        }
    }

    fn remove_tree(&mut self, name: &str) {
        for descendant in self.below(name) {
            self.datasets.remove(&descendant);
        }
        self.datasets.remove(name);
    }

    fn rename_prefix(&mut self, from: &str, to: &str) {
        let affected: Vec<String> = self
            .datasets
            .keys()
            .filter(|name| depth_below(from, name).is_some())
            .cloned()
            .collect();
        let remap = |name: &str| -> String { format!("{to}{}", &name[from.len()..]) };
        for old in &affected {
            if let Some(node) = self.datasets.remove(old) {
                self.datasets.insert(remap(old), node);
            }
        }
        for node in self.datasets.values_mut() {
            if let Some(origin) = &node.origin {
                if affected.contains(origin) {
                    node.origin = Some(remap(origin));
                }
            }
        }
    }
}

struct Args {
    flags: BTreeSet<String>,
    options: Vec<(String, String)>,
    positional: Vec<String>,
}

/// Splits `argv` into single-letter flags, valued options and operands.
fn parse(argv: &[String], valued: &[&str]) -> Args {
    let mut args = Args {
        flags: BTreeSet::new(),
        options: Vec::new(),
        positional: Vec::new(),
    };
    let mut iter = argv.iter();
    while let Some(arg) = iter.next() {
        if let Some(flags) = arg.strip_prefix('-').filter(|f| !f.is_empty()) {
            if valued.contains(&arg.as_str()) {
                let value = iter.next().cloned().unwrap_or_default();
                args.options.push((arg.clone(), value));
            } else {
                for flag in flags.chars() {
                    args.flags.insert(format!("-{flag}"));
                }
            }
        } else {
            args.positional.push(arg.clone());
        }
    }
    args
}

impl Args {
    fn has(&self, flag: &str) -> bool {
        self.flags.contains(flag)
    }

    fn option(&self, name: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    fn props(&self) -> Vec<(String, String)> {
        self.options
            .iter()
            .filter(|(key, _)| key == "-o")
            .filter_map(|(_, kv)| kv.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn depth(&self) -> Option<u32> {
        if self.has("-r") {
            None
        } else {
            Some(self.option("-d").and_then(|d| d.parse().ok()).unwrap_or(0))
        }
    }

    fn kinds(&self) -> Option<Vec<String>> {
        self.option("-t")
            .map(|t| t.split(',').map(str::to_string).collect())
    }
}

impl FakeZfs {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_buffering() -> Arc<Self> {
        Arc::new(Self {
            buffering: true,
            ..Self::default()
        })
    }

    pub fn zfs(self: &Arc<Self>) -> Zfs {
        Zfs::new(self.clone())
    }

    /// Seeds a dataset; parents are not checked.
    pub fn add(&self, name: &str, kind: DatasetKind) {
        self.state.lock().unwrap().insert(name, kind, None);
    }

    pub fn set_stream_size(&self, snapshot: &str, size: u64) {
        if let Some(node) = self.state.lock().unwrap().datasets.get_mut(snapshot) {
            node.stream_size = size;
        }
    }

    pub fn exists(&self, name: &str) -> bool {
        self.state.lock().unwrap().datasets.contains_key(name)
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of invocations of `zfs <subcommand>`.
    pub fn count(&self, subcommand: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|argv| argv.get(1).map(String::as_str) == Some(subcommand))
            .count()
    }

    fn dispatch(&self, argv: &[String]) -> Reply {
        let mut state = self.state.lock().unwrap();
        let (subcommand, rest) = match argv {
            [tool, subcommand, rest @ ..] if tool == "zfs" => (subcommand.as_str(), rest),
            _ => return Err(format!("unknown command {argv:?}")),
        };
        match subcommand {
            "list" => list(&state, &parse(rest, &["-d", "-t", "-o"])),
            "get" => get(&state, &parse(rest, &["-d", "-t", "-s"])),
            "set" => set(&mut state, &parse(rest, &[])),
            "inherit" => inherit(&mut state, &parse(rest, &[])),
            "create" => create(&mut state, &parse(rest, &["-V", "-o"])),
            "destroy" => destroy(&mut state, &parse(rest, &[])),
            "snapshot" => snapshot(&mut state, &parse(rest, &["-o"])),
            "rollback" => rollback(&mut state, &parse(rest, &[])),
            "clone" => clone(&mut state, &parse(rest, &["-o"])),
            "promote" => promote(&mut state, &parse(rest, &[])),
            "rename" => rename(&mut state, &parse(rest, &[])),
            "hold" => hold(&mut state, &parse(rest, &[]), true),
            "release" => hold(&mut state, &parse(rest, &[]), false),
            "holds" => holds(&state, &parse(rest, &[])),
            "send" => send(&state, &parse(rest, &["-I", "-i"])),
            other => Err(format!("unrecognized command '{other}'")),
        }
    }
}

#[async_trait]
impl Endpoint for FakeZfs {
    fn shell_prefix(&self) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string()]
    }

    fn is_local(&self) -> bool {
        true
    }

    fn has_buffering_tool(&self) -> bool {
        self.buffering
    }

    async fn execute(&self, argv: &[String]) -> Result<CommandOutput> {
        self.calls.lock().unwrap().push(argv.to_vec());
        Ok(match self.dispatch(argv) {
            Ok(stdout) => CommandOutput {
                code: Some(0),
                stdout,
                stderr: String::new(),
            },
            Err(stderr) => CommandOutput {
                code: Some(1),
                stdout: String::new(),
                stderr,
            },
        })
    }
}

fn selected<'a>(state: &'a State, args: &Args) -> std::result::Result<Vec<&'a String>, String> {
    let depth = args.depth();
    let kinds = args.kinds();
    let root = args.positional.last().map(|p| p.trim_end_matches('/'));
    if let Some(root) = root {
        state.node(root)?;
    }

    Ok(state
        .ordered()
        .into_iter()
        .filter(|name| {
            let node = &state.datasets[*name];
            let level = match root {
                Some(root) => depth_below(root, name),
                None => Some(u32::from(name.contains('@')) + dataset_part(name).matches('/').count() as u32),
            };
            let within = match (level, depth) {
                (None, _) => false,
                (Some(_), None) => true,
                (Some(level), Some(depth)) => level <= depth,
            };
            let kind_ok = match &kinds {
                Some(kinds) => kinds.iter().any(|k| k == "all" || k == node.kind.as_str()),
                // snapshots are only listed when asked for
                None => !node.kind.is_snapshot() || root.is_some_and(|r| r.contains('@')),
            };
            within && kind_ok
        })
        .collect())
}

fn list(state: &State, args: &Args) -> Reply {
    Ok(selected(state, args)?
        .into_iter()
        .map(|name| format!("{}\t{}\n", name, state.datasets[name].kind.as_str()))
        .collect())
}

fn get(state: &State, args: &Args) -> Reply {
    let (props, path) = match args.positional.as_slice() {
        [props] => (props, None),
        [props, path] => (props, Some(path)),
        _ => return Err("usage: get".to_string()),
    };
    let mut filtered = Args {
        flags: args.flags.clone(),
        options: args.options.clone(),
        positional: path.into_iter().cloned().collect(),
    };
    if filtered.kinds().is_none() {
        filtered.options.push(("-t".to_string(), "all".to_string()));
    }

    let mut out = String::new();
    for name in selected(state, &filtered)? {
        let node = &state.datasets[name];
        let requested: Vec<String> = if props == "all" {
            ["type", "name", "guid", "createtxg", "origin", "clones"]
                .iter()
                .map(|p| p.to_string())
                .chain(node.props.keys().cloned())
                .collect()
        } else {
            props.split(',').map(str::to_string).collect()
        };
        for prop in requested {
            if let Some((value, source)) = state.property(name, node, &prop) {
                out.push_str(&format!("{name}\t{prop}\t{value}\t{source}\n"));
            }
        }
    }
    Ok(out)
}

fn set(state: &mut State, args: &Args) -> Reply {
    let [assignment, name] = args.positional.as_slice() else {
        return Err("usage: set".to_string());
    };
    let (key, value) = assignment
        .split_once('=')
        .ok_or_else(|| "bad property assignment".to_string())?;
    let node = state.datasets.get_mut(name).ok_or_else(|| not_found(name))?;
    node.props.insert(key.to_string(), value.to_string());
    Ok(String::new())
}

fn inherit(state: &mut State, args: &Args) -> Reply {
    let [key, name] = args.positional.as_slice() else {
        return Err("usage: inherit".to_string());
    };
    state.node(name)?;
    let targets: Vec<String> = if args.has("-r") {
        state
            .datasets
            .keys()
            .filter(|n| depth_below(name, n).is_some())
            .cloned()
            .collect()
    } else {
        vec![name.clone()]
    };
    for target in targets {
        if let Some(node) = state.datasets.get_mut(&target) {
            node.props.remove(key);
        }
    }
    Ok(String::new())
}

fn ensure_parent(state: &mut State, name: &str, create_missing: bool) -> std::result::Result<(), String> {
    let Some(parent) = parent_of(name) else {
        return Ok(());
    };
    if state.datasets.contains_key(parent) {
        return Ok(());
    }
    if !create_missing {
        return Err(format!("cannot create '{name}': parent does not exist"));
    }
    ensure_parent(state, parent, true)?;
    state.insert(parent, DatasetKind::Filesystem, None);
    Ok(())
}

fn create(state: &mut State, args: &Args) -> Reply {
    let [name] = args.positional.as_slice() else {
        return Err("usage: create".to_string());
    };
    if state.datasets.contains_key(name) {
        return Err(format!("cannot create '{name}': dataset already exists"));
    }
    ensure_parent(state, name, args.has("-p"))?;
    let kind = if args.option("-V").is_some() {
        DatasetKind::Volume
    } else {
        DatasetKind::Filesystem
    };
    state.insert(name, kind, None);
    if let Some(node) = state.datasets.get_mut(name) {
        node.props.extend(args.props());
    }
    Ok(String::new())
}

fn destroy(state: &mut State, args: &Args) -> Reply {
    let [name] = args.positional.as_slice() else {
        return Err("usage: destroy".to_string());
    };
    let node = state.node(name)?.clone();

    if node.kind.is_snapshot() {
        if !node.holds.is_empty() && !args.has("-d") {
            return Err(format!("cannot destroy snapshot {name}: dataset is busy"));
        }
        let clones = state.clones_of(name);
        if !clones.is_empty() {
            if !args.has("-R") {
                return Err(format!("cannot destroy '{name}': snapshot has dependent clones"));
            }
            for clone in clones {
                state.remove_tree(&clone);
            }
        }
        if !node.holds.is_empty() {
            // deferred until the last hold is released
            if let Some(node) = state.datasets.get_mut(name) {
                node.props.insert("defer_destroy".to_string(), "on".to_string());
            }
            return Ok(String::new());
        }
        state.datasets.remove(name);
        return Ok(String::new());
    }

    let below = state.below(name);
    if !below.is_empty() && !args.has("-r") && !args.has("-R") {
        return Err(format!("cannot destroy '{name}': filesystem has children"));
    }
    for snapshot in below.iter().filter(|n| n.contains('@')) {
        let clones = state.clones_of(snapshot);
        if !clones.is_empty() && !args.has("-R") {
            return Err(format!("cannot destroy '{name}': filesystem has dependent clones"));
        }
        for clone in clones {
            state.remove_tree(&clone);
        }
    }
    state.remove_tree(name);
    Ok(String::new())
}

fn snapshot(state: &mut State, args: &Args) -> Reply {
    let [name] = args.positional.as_slice() else {
        return Err("usage: snapshot".to_string());
    };
    let (dataset, label) = name
        .split_once('@')
        .ok_or_else(|| format!("cannot create snapshot '{name}': missing '@'"))?;
    state.node(dataset)?;

    let mut targets = vec![dataset.to_string()];
    if args.has("-r") {
        targets.extend(state.below(dataset).into_iter().filter(|n| !n.contains('@')));
    }
    let names: Vec<String> = targets.iter().map(|t| format!("{t}@{label}")).collect();
    if let Some(existing) = names.iter().find(|n| state.datasets.contains_key(*n)) {
        return Err(format!("cannot create snapshot '{existing}': dataset already exists"));
    }
    for snapshot in &names {
        state.insert(snapshot, DatasetKind::Snapshot, None);
        if let Some(node) = state.datasets.get_mut(snapshot) {
            node.props.extend(args.props());
        }
    }
    Ok(String::new())
}

fn rollback(state: &mut State, args: &Args) -> Reply {
    let [name] = args.positional.as_slice() else {
        return Err("usage: rollback".to_string());
    };
    let target = state.node(name)?.txg;
    let dataset = dataset_part(name).to_string();
    let newer: Vec<String> = state
        .datasets
        .iter()
        .filter(|(n, node)| node.kind.is_snapshot() && dataset_part(n) == dataset && node.txg > target)
        .map(|(n, _)| n.clone())
        .collect();

    if newer.is_empty() {
        return Ok(String::new());
    }
    if !args.has("-r") && !args.has("-R") {
        return Err(format!(
            "cannot rollback to '{name}': more recent snapshots or bookmarks exist\nuse '-r' to force deletion of the following snapshots and bookmarks:\n{}",
            newer.join("\n")
        ));
    }
    let clones: Vec<String> = newer.iter().flat_map(|n| state.clones_of(n)).collect();
    if !clones.is_empty() && !args.has("-R") {
        return Err(format!(
            "cannot rollback to '{name}': clones of previous snapshots exist\nuse '-R' to force deletion of the following clones and dependents:\n{}",
            clones.join("\n")
        ));
    }
    for clone in clones {
        state.remove_tree(&clone);
    }
    for snapshot in newer {
        state.datasets.remove(&snapshot);
    }
    Ok(String::new())
}

fn clone(state: &mut State, args: &Args) -> Reply {
    let [snapshot, target] = args.positional.as_slice() else {
        return Err("usage: clone".to_string());
    };
    let origin = state.node(snapshot)?;
    if !origin.kind.is_snapshot() {
        return Err(format!("cannot clone '{snapshot}': not a snapshot"));
    }
    if state.datasets.contains_key(target) {
        return Err(format!("cannot create '{target}': dataset already exists"));
    }
    let kind = state.node(dataset_part(snapshot))?.kind;
    ensure_parent(state, target, args.has("-p"))?;
    state.insert(target, kind, Some(snapshot.clone()));
    if let Some(node) = state.datasets.get_mut(target) {
        node.props.extend(args.props());
    }
    Ok(String::new())
}

fn promote(state: &mut State, args: &Args) -> Reply {
    let [name] = args.positional.as_slice() else {
        return Err("usage: promote".to_string());
    };
    let origin = state
        .node(name)?
        .origin
        .clone()
        .ok_or_else(|| format!("cannot promote '{name}': not a cloned filesystem"))?;
    let origin_txg = state.node(&origin)?.txg;
    let origin_dataset = dataset_part(&origin).to_string();

    let moved: Vec<String> = state
        .datasets
        .iter()
        .filter(|(n, node)| {
            node.kind.is_snapshot() && dataset_part(n) == origin_dataset && node.txg <= origin_txg
        })
        .map(|(n, _)| n.clone())
        .collect();

    let mut renames = BTreeMap::new();
    for old in &moved {
        let label = old.split_once('@').map_or("", |(_, label)| label);
        let new = format!("{name}@{label}");
        if state.datasets.contains_key(&new) {
            return Err(format!("cannot promote '{name}': snapshot name collision {new}"));
        }
        renames.insert(old.clone(), new);
    }
    for (old, new) in &renames {
        if let Some(node) = state.datasets.remove(old) {
            state.datasets.insert(new.clone(), node);
        }
    }
    for node in state.datasets.values_mut() {
        if let Some(current) = &node.origin {
            if let Some(new) = renames.get(current) {
                node.origin = Some(new.clone());
            }
        }
    }
    if let Some(node) = state.datasets.get_mut(name) {
        node.origin = None;
    }
    // the former origin becomes a clone of the moved snapshot
    let moved_origin = renames.get(&origin).cloned();
    if let Some(node) = state.datasets.get_mut(&origin_dataset) {
        node.origin = moved_origin;
    }
    Ok(String::new())
}

fn rename(state: &mut State, args: &Args) -> Reply {
    let [from, to] = args.positional.as_slice() else {
        return Err("usage: rename".to_string());
    };
    state.node(from)?;
    if state.datasets.contains_key(to) {
        return Err(format!("cannot rename to '{to}': dataset already exists"));
    }

    if from.contains('@') {
        let (dataset, old_label) = from.split_once('@').unwrap_or_default();
        let new_label = to.split_once('@').map_or("", |(_, label)| label).to_string();
        let mut pairs = vec![(from.clone(), to.clone())];
        if args.has("-r") {
            for name in state.below(dataset) {
                if name.ends_with(&format!("@{old_label}")) && name != *from {
                    let new = format!("{}@{new_label}", dataset_part(&name));
                    pairs.push((name, new));
                }
            }
        }
        for (old, new) in pairs {
            if let Some(node) = state.datasets.remove(&old) {
                state.datasets.insert(new.clone(), node);
            }
            for node in state.datasets.values_mut() {
                if node.origin.as_deref() == Some(old.as_str()) {
                    node.origin = Some(new.clone());
                }
            }
        }
        return Ok(String::new());
    }

    ensure_parent(state, to, args.has("-p"))?;
    state.rename_prefix(from, to);
    Ok(String::new())
}

fn hold(state: &mut State, args: &Args, add: bool) -> Reply {
    let [tag, name] = args.positional.as_slice() else {
        return Err("usage: hold".to_string());
    };
    let mut targets = vec![name.clone()];
    if args.has("-r") {
        let (dataset, label) = name.split_once('@').unwrap_or_default();
        targets.extend(
            state
                .below(dataset)
                .into_iter()
                .filter(|n| n != name && n.ends_with(&format!("@{label}"))),
        );
    }
    for target in targets {
        let node = state.datasets.get_mut(&target).ok_or_else(|| not_found(&target))?;
        if add {
            if !node.holds.insert(tag.clone()) {
                return Err(format!("cannot hold snapshot '{target}': tag already exists on this dataset"));
            }
        } else {
            if !node.holds.remove(tag) {
                return Err(format!("cannot release hold from snapshot '{target}': no such tag on this dataset"));
            }
            let deferred = node.props.get("defer_destroy").is_some_and(|v| v == "on");
            if deferred && node.holds.is_empty() {
                state.datasets.remove(&target);
            }
        }
    }
    Ok(String::new())
}

fn holds(state: &State, args: &Args) -> Reply {
    let [name] = args.positional.as_slice() else {
        return Err("usage: holds".to_string());
    };
    Ok(state
        .node(name)?
        .holds
        .iter()
        .map(|tag| format!("{name}\t{tag}\tThu Jan  1 00:00 1970\n"))
        .collect())
}

fn send(state: &State, args: &Args) -> Reply {
    if !args.has("-n") {
        return Err("only dry runs are simulated".to_string());
    }
    let [name] = args.positional.as_slice() else {
        return Err("usage: send".to_string());
    };
    let node = state.node(name)?;
    match args.option("-I").or_else(|| args.option("-i")) {
        Some(base) => {
            state.node(base)?;
            Ok(format!(
                "incremental\t{base}\t{name}\t{size}\nsize\t{size}\n",
                size = node.stream_size
            ))
        }
        None => Ok(format!(
            "full\t{name}\t{size}\nsize\t{size}\n",
            size = node.stream_size
        )),
    }
}
