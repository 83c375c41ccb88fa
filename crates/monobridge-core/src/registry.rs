//! Opaque-handle registry
//!
//! Every value that crosses the host/engine boundary travels as a
//! [`Handle`]: a slot index plus a generation counter into a kind-tagged
//! table. The table owns the value; the handle is `Copy` and carries no
//! lifetime. Consuming operations remove the entry and bump the slot's
//! generation, so any later access through a stale handle is a detectable
//! error rather than undefined behavior.
//!
//! # Locking
//!
//! One mutex guards the slot table together with its free list. Closures
//! passed to [`HandleRegistry::with`] run under that lock and must not
//! call back into the registry.

use monobridge_common::{BridgeError, Result};
use std::any::Any;
use std::sync::Mutex;

/// Resource kinds a handle can be tagged with.
///
/// A handle's kind is fixed at [`HandleRegistry::wrap`] time and checked
/// on every access.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    ServerConfig,
    Server,
    RouteInfo,
    EndpointContext,
    Request,
    Response,
    RpcParam,
    StreamProvider,
    CallInfo,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 9] = [
        ResourceKind::ServerConfig,
        ResourceKind::Server,
        ResourceKind::RouteInfo,
        ResourceKind::EndpointContext,
        ResourceKind::Request,
        ResourceKind::Response,
        ResourceKind::RpcParam,
        ResourceKind::StreamProvider,
        ResourceKind::CallInfo,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ResourceKind::ServerConfig => "ServerConfig",
            ResourceKind::Server => "Server",
            ResourceKind::RouteInfo => "RouteInfo",
            ResourceKind::EndpointContext => "EndpointContext",
            ResourceKind::Request => "Request",
            ResourceKind::Response => "Response",
            ResourceKind::RpcParam => "RpcParam",
            ResourceKind::StreamProvider => "StreamProvider",
            ResourceKind::CallInfo => "CallInfo",
        }
    }
}

/// A type-tagged, single-use reference to a registry entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Handle {
    slot: u32,
    generation: u32,
}

struct Entry {
    kind: ResourceKind,
    value: Box<dyn Any + Send>,
}

struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

struct Table {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

/// Kind-tagged slot table with generation-checked access.
pub struct HandleRegistry {
    table: Mutex<Table>,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(Table {
                slots: Vec::new(),
                free: Vec::new(),
            }),
        }
    }

    /// Store `value` under `kind` and return the handle for it.
    pub fn wrap<T: Any + Send>(&self, kind: ResourceKind, value: T) -> Handle {
        let mut table = self.table.lock().unwrap();

        let slot = match table.free.pop() {
            Some(slot) => slot,
            None => {
                table.slots.push(Slot {
                    generation: 0,
                    entry: None,
                });
                (table.slots.len() - 1) as u32
            }
        };

        let s = &mut table.slots[slot as usize];
        s.entry = Some(Entry {
            kind,
            value: Box::new(value),
        });

        Handle {
            slot,
            generation: s.generation,
        }
    }

    /// Borrow the entry behind `handle`, checking its kind, and run `f`
    /// on it. `f` runs under the registry lock and must not re-enter the
    /// registry.
    pub fn with<T: Any, R>(
        &self,
        handle: Handle,
        kind: ResourceKind,
        f: impl FnOnce(&mut T) -> R,
    ) -> Result<R> {
        let mut table = self.table.lock().unwrap();
        let entry = lookup(&mut table, handle)?;

        if entry.kind != kind {
            return Err(mismatch(kind, entry.kind));
        }
        let value = entry
            .value
            .downcast_mut::<T>()
            .ok_or_else(|| foreign_value(kind))?;

        Ok(f(value))
    }

    /// Consume the entry behind `handle`: remove it from the table,
    /// invalidate the handle, and return the owned value.
    pub fn take<T: Any>(&self, handle: Handle, kind: ResourceKind) -> Result<Box<T>> {
        let mut table = self.table.lock().unwrap();
        let entry = lookup(&mut table, handle)?;

        if entry.kind != kind {
            return Err(mismatch(kind, entry.kind));
        }
        if !entry.value.is::<T>() {
            return Err(foreign_value(kind));
        }

        let entry = release(&mut table, handle);
        // is::<T> held above, so the downcast cannot fail
        Ok(entry.value.downcast::<T>().unwrap())
    }

    /// Mark the entry behind `handle` consumed without retrieving it.
    pub fn invalidate(&self, handle: Handle) -> Result<()> {
        let mut table = self.table.lock().unwrap();
        lookup(&mut table, handle)?;
        release(&mut table, handle);
        Ok(())
    }

    /// Whether `handle` still refers to a live entry.
    pub fn is_valid(&self, handle: Handle) -> bool {
        let mut table = self.table.lock().unwrap();
        lookup(&mut table, handle).is_ok()
    }

    /// The kind stored for `handle`, if it is still live.
    pub fn kind_of(&self, handle: Handle) -> Option<ResourceKind> {
        let mut table = self.table.lock().unwrap();
        lookup(&mut table, handle).ok().map(|e| e.kind)
    }
}

impl Default for HandleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn lookup(table: &mut Table, handle: Handle) -> Result<&mut Entry> {
    table
        .slots
        .get_mut(handle.slot as usize)
        .filter(|s| s.generation == handle.generation)
        .and_then(|s| s.entry.as_mut())
        .ok_or(BridgeError::UseAfterConsume)
}

/// Remove the entry, bump the generation so the handle goes stale, and
/// recycle the slot. Caller must have validated the handle via `lookup`.
fn release(table: &mut Table, handle: Handle) -> Entry {
    let s = &mut table.slots[handle.slot as usize];
    let entry = s.entry.take().unwrap();
    s.generation = s.generation.wrapping_add(1);
    table.free.push(handle.slot);
    entry
}

fn mismatch(expected: ResourceKind, found: ResourceKind) -> BridgeError {
    // A kind mismatch is an integration bug, not a runtime condition.
    tracing::error!(
        expected = expected.name(),
        found = found.name(),
        "handle kind mismatch"
    );
    BridgeError::TypeMismatch {
        expected: expected.name(),
        found: found.name(),
    }
}

fn foreign_value(expected: ResourceKind) -> BridgeError {
    tracing::error!(
        expected = expected.name(),
        "handle kind matches but stored value has a different type"
    );
    BridgeError::TypeMismatch {
        expected: expected.name(),
        found: "(value of unexpected type)",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_and_with() {
        let registry = HandleRegistry::new();
        let h = registry.wrap(ResourceKind::Request, 41u32);

        let v = registry
            .with::<u32, _>(h, ResourceKind::Request, |v| {
                *v += 1;
                *v
            })
            .unwrap();
        assert_eq!(v, 42);
        assert!(registry.is_valid(h));
        assert_eq!(registry.kind_of(h), Some(ResourceKind::Request));
    }

    #[test]
    fn test_take_consumes() {
        let registry = HandleRegistry::new();
        let h = registry.wrap(ResourceKind::Response, String::from("payload"));

        let v = registry.take::<String>(h, ResourceKind::Response).unwrap();
        assert_eq!(*v, "payload");

        let err = registry.with::<String, _>(h, ResourceKind::Response, |_| ()).unwrap_err();
        assert!(matches!(err, BridgeError::UseAfterConsume));
        assert!(!registry.is_valid(h));
    }

    #[test]
    fn test_invalidate() {
        let registry = HandleRegistry::new();
        let h = registry.wrap(ResourceKind::CallInfo, 7u64);

        registry.invalidate(h).unwrap();
        assert!(matches!(registry.invalidate(h), Err(BridgeError::UseAfterConsume)));
    }

    #[test]
    fn test_kind_mismatch_for_every_other_kind() {
        let registry = HandleRegistry::new();

        for stored in ResourceKind::ALL {
            let h = registry.wrap(stored, 0u8);
            for asked in ResourceKind::ALL {
                if asked == stored {
                    continue;
                }
                let err = registry.with::<u8, _>(h, asked, |_| ()).unwrap_err();
                match err {
                    BridgeError::TypeMismatch { expected, found } => {
                        assert_eq!(expected, asked.name());
                        assert_eq!(found, stored.name());
                    }
                    other => panic!("expected TypeMismatch, got {other:?}"),
                }
            }
        }
    }

    #[test]
    fn test_downcast_mismatch_is_type_mismatch() {
        let registry = HandleRegistry::new();
        let h = registry.wrap(ResourceKind::RpcParam, 1i32);

        let err = registry.take::<String>(h, ResourceKind::RpcParam).unwrap_err();
        assert!(matches!(err, BridgeError::TypeMismatch { .. }));
        // Failed downcast must not consume the entry.
        assert!(registry.is_valid(h));
    }

    #[test]
    fn test_stale_generation_rejected_after_slot_reuse() {
        let registry = HandleRegistry::new();
        let old = registry.wrap(ResourceKind::Request, 1u32);
        registry.invalidate(old).unwrap();

        // The slot is recycled for the next wrap; the old handle must
        // stay dead even though the slot is live again.
        let new = registry.wrap(ResourceKind::Request, 2u32);
        assert!(registry.is_valid(new));
        assert!(!registry.is_valid(old));
        assert!(matches!(
            registry.with::<u32, _>(old, ResourceKind::Request, |_| ()),
            Err(BridgeError::UseAfterConsume)
        ));
    }

    #[test]
    fn test_cross_thread_wrap_and_take() {
        use std::sync::Arc;

        let registry = Arc::new(HandleRegistry::new());
        let r = registry.clone();
        let h = std::thread::spawn(move || r.wrap(ResourceKind::CallInfo, 99u64))
            .join()
            .unwrap();

        assert_eq!(*registry.take::<u64>(h, ResourceKind::CallInfo).unwrap(), 99);
    }
}
