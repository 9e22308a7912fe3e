#![allow(dead_code)]

use wasmer::TypedFunction;
use wasmer_bridge::{InstantiatedHandle, LoadOptions, Loader, LoaderConfig};

/// The message `fail_app` and friends leave in the exception store.
pub const FAILURE_MESSAGE: &str = "start_app exploded";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Memory {
    /// `(import "wbg" "memory" (memory min max?))`
    Imported { min: u32, max: Option<u32> },
    /// `(memory (export "memory") pages)`
    Exported { pages: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartHook {
    None,
    /// Counts how often it ran in the `started` global.
    Counting,
    /// Stores an exception and returns.
    Failing,
}

/// A hand-written stand-in for a bindgen-generated module.
///
/// The allocator is a bump allocator with an exact-size free list. Every
/// block has an 8 byte header: the next free block at `ptr - 8` and the
/// rounded size at `ptr - 4`.
#[derive(Debug, Clone, Copy)]
pub struct Fixture {
    pub memory: Memory,
    pub start_hook: StartHook,
    /// Adds a wasm `(start)` function that traps.
    pub trapping_start: bool,
}

impl Default for Fixture {
    fn default() -> Self {
        Fixture {
            memory: Memory::Imported { min: 1, max: None },
            start_hook: StartHook::Counting,
            trapping_start: false,
        }
    }
}

impl Fixture {
    pub fn with_memory(self, memory: Memory) -> Self {
        Fixture { memory, ..self }
    }

    pub fn with_start_hook(self, start_hook: StartHook) -> Self {
        Fixture { start_hook, ..self }
    }

    pub fn with_trapping_start(self) -> Self {
        Fixture {
            trapping_start: true,
            ..self
        }
    }

    pub fn wat(&self) -> String {
        let memory = match self.memory {
            Memory::Imported { min, max: Some(max) } => {
                format!(r#"(import "wbg" "memory" (memory {min} {max}))"#)
            }
            Memory::Imported { min, max: None } => {
                format!(r#"(import "wbg" "memory" (memory {min}))"#)
            }
            Memory::Exported { pages } => format!(r#"(memory (export "memory") {pages})"#),
        };

        let start_hook = match self.start_hook {
            StartHook::None => "",
            StartHook::Counting => {
                r#"(func (export "__wbindgen_start")
                     (global.set $started (i32.add (global.get $started) (i32.const 1))))"#
            }
            StartHook::Failing => {
                r#"(func (export "__wbindgen_start")
                     (call $exn_store (i32.const 16) (i32.const 18)))"#
            }
        };

        let trapping_start = if self.trapping_start {
            "(func $boom unreachable) (start $boom)"
        } else {
            ""
        };

        format!(
            r#"
(module
  (type $binary_cb (func (param i32 i32 i32 i32) (result i32)))
  (type $nullary_cb (func (param i32)))

  (import "wbg" "__wbindgen_exn_store" (func $exn_store (param i32 i32)))
  {memory}

  (table (export "__wbindgen_export_2") 1 funcref)

  (global $heap (mut i32) (i32.const 1024))
  (global $free_list (mut i32) (i32.const 0))
  (global $started (mut i32) (i32.const 0))
  (global $runs (mut i32) (i32.const 0))

  (data (i32.const 16) "{FAILURE_MESSAGE}")

  (func $round (param $size i32) (result i32)
    (if (result i32) (i32.eqz (local.get $size))
      (then (i32.const 8))
      (else (i32.and (i32.add (local.get $size) (i32.const 7)) (i32.const -8)))))

  (func $malloc (export "__wbindgen_malloc") (param $size i32) (result i32)
    (local $rounded i32) (local $prev i32) (local $cur i32)
    (local $ptr i32) (local $end i32) (local $available i32)

    (if (i32.gt_u (local.get $size) (i32.const 0x7fff0000)) (then unreachable))
    (local.set $rounded (call $round (local.get $size)))

    (local.set $cur (global.get $free_list))
    (block $exhausted
      (loop $search
        (br_if $exhausted (i32.eqz (local.get $cur)))
        (if (i32.eq (i32.load (i32.sub (local.get $cur) (i32.const 4))) (local.get $rounded))
          (then
            (if (i32.eqz (local.get $prev))
              (then
                (global.set $free_list (i32.load (i32.sub (local.get $cur) (i32.const 8)))))
              (else
                (i32.store (i32.sub (local.get $prev) (i32.const 8))
                  (i32.load (i32.sub (local.get $cur) (i32.const 8))))))
            (return (local.get $cur))))
        (local.set $prev (local.get $cur))
        (local.set $cur (i32.load (i32.sub (local.get $cur) (i32.const 8))))
        (br $search)))

    (local.set $ptr (i32.add (global.get $heap) (i32.const 8)))
    (local.set $end (i32.add (local.get $ptr) (local.get $rounded)))
    (local.set $available (i32.mul (memory.size) (i32.const 65536)))
    (if (i32.gt_u (local.get $end) (local.get $available))
      (then
        (if (i32.eq
              (memory.grow
                (i32.shr_u
                  (i32.add (i32.sub (local.get $end) (local.get $available)) (i32.const 65535))
                  (i32.const 16)))
              (i32.const -1))
          (then unreachable))))

    (i32.store (i32.sub (local.get $ptr) (i32.const 4)) (local.get $rounded))
    (global.set $heap (local.get $end))
    (local.get $ptr))

  (func $free (export "__wbindgen_free") (param $ptr i32) (param $size i32)
    (i32.store (i32.sub (local.get $ptr) (i32.const 8)) (global.get $free_list))
    (global.set $free_list (local.get $ptr)))

  (func (export "__wbindgen_realloc")
    (param $ptr i32) (param $old i32) (param $new i32) (result i32)
    (local $fresh i32)
    (local.set $fresh (call $malloc (local.get $new)))
    (memory.copy
      (local.get $fresh)
      (local.get $ptr)
      (select (local.get $old) (local.get $new) (i32.lt_u (local.get $old) (local.get $new))))
    (call $free (local.get $ptr) (local.get $old))
    (local.get $fresh))

  (func (export "invoke_binary")
    (param $index i32) (param $a i32) (param $b i32) (param $out1 i32) (param $out2 i32)
    (result i32)
    (call_indirect (type $binary_cb)
      (local.get $a) (local.get $b) (local.get $out1) (local.get $out2)
      (local.get $index)))

  (func (export "invoke_nullary") (param $index i32) (param $context i32)
    (call_indirect (type $nullary_cb) (local.get $context) (local.get $index)))

  (func (export "start_app")
    (global.set $runs (i32.add (global.get $runs) (i32.const 1))))
  (func (export "runs") (result i32) (global.get $runs))
  (func (export "started") (result i32) (global.get $started))
  (func (export "fail_app")
    (call $exn_store (i32.const 16) (i32.const 18))
    unreachable)
  (func (export "fail_quietly")
    (call $exn_store (i32.const 16) (i32.const 18)))
  (func (export "trap_app") unreachable)

  {start_hook}
  {trapping_start}
)
"#
        )
    }

    pub fn wasm(&self) -> Vec<u8> {
        wasmer::wat2wasm(self.wat().as_bytes()).unwrap().into_owned()
    }
}

/// The default fixture's bytes.
pub fn wasm() -> Vec<u8> {
    Fixture::default().wasm()
}

pub fn loader() -> Loader {
    Loader::new(LoaderConfig::default())
}

/// Load the default fixture without an async runtime.
pub fn instantiate() -> InstantiatedHandle {
    loader().load_sync(wasm(), LoadOptions::default()).unwrap()
}

/// Load a module built from hand-edited fixture text.
pub fn instantiate_wat(wat: &str) -> InstantiatedHandle {
    let wasm = wasmer::wat2wasm(wat.as_bytes()).unwrap().into_owned();
    loader().load_sync(wasm, LoadOptions::default()).unwrap()
}

/// Read one of the fixture's `() -> i32` counters.
pub fn counter(handle: &mut InstantiatedHandle, name: &str) -> i32 {
    let function: TypedFunction<(), i32> = handle
        .instance()
        .exports
        .get_typed_function(handle.store(), name)
        .unwrap();
    function.call(handle.store_mut()).unwrap()
}
