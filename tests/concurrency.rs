//! Concurrent use of the container manager.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;

use packgen::{
    compile_serializer, ContainerManager, ContainerMode, EmitterFlavor, OpcodeBuilder,
    SerializationContext, SerializationTarget, Value, ValueType,
};
use packgen::target::{Getter, MemberDescriptor, Setter};
use packgen::CodecError;

fn seq_getter(i: usize) -> Getter {
    Arc::new(move |v| match v {
        Value::Seq(items) => items
            .get(i)
            .cloned()
            .ok_or_else(|| CodecError::Message(format!("missing field {i}"))),
        other => Err(CodecError::TypeMismatch {
            expected: ValueType::Seq,
            found: other.type_of(),
        }),
    })
}

fn seq_setter(i: usize) -> Setter {
    Arc::new(move |obj, val| match obj {
        Value::Seq(items) => {
            if items.len() <= i {
                items.resize(i + 1, Value::Nil);
            }
            items[i] = val;
            Ok(())
        }
        other => Err(CodecError::TypeMismatch {
            expected: ValueType::Seq,
            found: other.type_of(),
        }),
    })
}

fn point_target() -> Arc<SerializationTarget> {
    Arc::new(SerializationTarget {
        type_name: "Point".to_owned(),
        members: vec![
            MemberDescriptor {
                name: "X".to_owned(),
                value_type: ValueType::Int,
                get: seq_getter(0),
                set: seq_setter(0),
                collection: None,
                schema: None,
            },
            MemberDescriptor {
                name: "Y".to_owned(),
                value_type: ValueType::Int,
                get: seq_getter(1),
                set: seq_setter(1),
                collection: None,
                schema: None,
            },
        ],
        tuple_like: true,
        self_pack: None,
    })
}

#[test]
fn emitter_sequence_numbers_are_unique_across_threads() {
    let manager = Arc::new(ContainerManager::new());
    let container = manager.container(ContainerMode::Fast).unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let manager = manager.clone();
        let container = container.clone();
        handles.push(thread::spawn(move || {
            let mut seqs = Vec::new();
            for _ in 0..8 {
                let emitter = manager
                    .emitter(&container, "Point", EmitterFlavor::FieldBased)
                    .unwrap();
                seqs.push(emitter.seq());
            }
            seqs
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.join().unwrap());
    }
    let unique: BTreeSet<u32> = all.iter().copied().collect();
    assert_eq!(unique.len(), 64);
    assert_eq!(unique, (0..64).collect::<BTreeSet<u32>>());
}

#[test]
fn sequence_numbers_are_not_reissued_after_refresh() {
    let manager = Arc::new(ContainerManager::new());
    let container = manager.container(ContainerMode::Fast).unwrap();
    let before: Vec<u32> = (0..4)
        .map(|_| {
            manager
                .emitter(&container, "Point", EmitterFlavor::FieldBased)
                .unwrap()
                .seq()
        })
        .collect();

    manager.refresh();
    let container = manager.container(ContainerMode::Fast).unwrap();
    let after: Vec<u32> = (0..4)
        .map(|_| {
            manager
                .emitter(&container, "Point", EmitterFlavor::FieldBased)
                .unwrap()
                .seq()
        })
        .collect();

    for seq in &after {
        assert!(!before.contains(seq));
    }
}

#[test]
fn concurrent_builds_share_one_container() {
    let manager = Arc::new(ContainerManager::new());
    let point = Value::Seq(vec![Value::Int(3), Value::Int(-4)]);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let manager = manager.clone();
        let point = point.clone();
        handles.push(thread::spawn(move || {
            let builder = OpcodeBuilder::new(
                manager,
                ContainerMode::Fast,
                EmitterFlavor::FieldBased,
            );
            let ser = compile_serializer(
                &builder,
                point_target(),
                Arc::new(SerializationContext::default()),
            )
            .unwrap();
            let bytes = ser.pack_to_vec(&point).unwrap();
            assert_eq!(ser.unpack_from_slice(&bytes).unwrap(), point);
            bytes
        }));
    }

    let outputs: Vec<Vec<u8>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(outputs.windows(2).all(|w| w[0] == w[1]));

    let container = manager.container(ContainerMode::Fast).unwrap();
    // 8 builds, 2 members, pack and unpack each.
    assert_eq!(container.program_count(), 32);
}
