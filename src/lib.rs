//! Serializer code generation for binary formats.
//!
//! Two interchangeable backends build executable pack/unpack operations
//! from resolved type descriptions: [`emitter::OpcodeBuilder`] emits
//! op-list programs into managed code containers, while
//! [`graph_builder::GraphBuilder`] builds typed expression graphs and
//! hands them to the host compiler. Both produce the same
//! [`serializer::Serializer`] runtime, so callers can switch backends
//! without observable wire differences.

pub mod builder;
pub mod compile;
pub mod container;
pub mod context;
pub mod emitter;
pub mod error;
pub mod format;
pub mod gen_context;
pub mod graph;
pub mod graph_builder;
pub mod intrinsics;
pub mod msgpack;
pub mod program;
pub mod serializer;
pub mod target;
pub mod value;

pub use builder::SerializerBuilder;
pub use container::{Capabilities, CodeContainer, ContainerManager, ContainerMode};
pub use context::{BuilderConfig, EnumSerializationMethod, SerializationContext};
pub use emitter::{Emitter, EmitterFlavor, OpcodeBuilder};
pub use error::{BuildError, CodecError};
pub use gen_context::{BuildState, GenContext};
pub use graph_builder::GraphBuilder;
pub use serializer::{Serializer, SerializerFactory};
pub use target::{
    CollectionTraits, EnumDescriptor, MemberDescriptor, PolymorphismSchema, SerializationTarget,
};
pub use value::{Value, ValueType};

use std::sync::Arc;

/// Build a serializer for `target` with `builder` and instantiate it
/// against `context` in one step.
pub fn compile_serializer(
    builder: &dyn SerializerBuilder,
    target: Arc<SerializationTarget>,
    context: Arc<SerializationContext>,
) -> Result<Serializer, BuildError> {
    let factory = builder.build_serializer(target, None)?;
    Ok(factory(context))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::{Compiler, RtVal, ThisRef};
    use crate::graph::{ExprNode, ExprType, NodeId, TypedNode};
    use crate::intrinsics::Machine;
    use crate::target::{Getter, SelfPack, Setter};

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

    fn member(name: &str, i: usize, ty: ValueType) -> MemberDescriptor {
        MemberDescriptor {
            name: name.to_owned(),
            value_type: ty,
            get: seq_getter(i),
            set: seq_setter(i),
            collection: None,
            schema: None,
        }
    }

    fn person_target(tuple_like: bool) -> Arc<SerializationTarget> {
        Arc::new(SerializationTarget {
            type_name: "Person".to_owned(),
            members: vec![
                member("Name", 0, ValueType::Str),
                member("Age", 1, ValueType::Int),
            ],
            tuple_like,
            self_pack: None,
        })
    }

    fn tagged_target() -> Arc<SerializationTarget> {
        let mut tags = member("Tags", 0, ValueType::Seq);
        tags.collection = Some(Arc::new(CollectionTraits::for_seq(ValueType::Str)));
        Arc::new(SerializationTarget {
            type_name: "Tagged".to_owned(),
            members: vec![tags],
            tuple_like: true,
            self_pack: None,
        })
    }

    fn color_enum() -> Arc<EnumDescriptor> {
        Arc::new(EnumDescriptor {
            type_name: "Color".to_owned(),
            members: vec![
                ("Red".to_owned(), 0),
                ("Green".to_owned(), 1),
                ("Blue".to_owned(), 2),
            ],
        })
    }

    fn alice() -> Value {
        Value::Seq(vec![Value::Str("Alice".to_owned()), Value::Int(30)])
    }

    fn ctx_default() -> Arc<SerializationContext> {
        Arc::new(SerializationContext::default())
    }

    fn opcode_builder(flavor: EmitterFlavor) -> OpcodeBuilder {
        OpcodeBuilder::new(
            Arc::new(ContainerManager::new()),
            ContainerMode::Fast,
            flavor,
        )
    }

    fn all_builders() -> Vec<Box<dyn SerializerBuilder>> {
        vec![
            Box::new(GraphBuilder::default()),
            Box::new(opcode_builder(EmitterFlavor::FieldBased)),
            Box::new(opcode_builder(EmitterFlavor::ContextBased)),
        ]
    }

    #[test]
    fn ordered_round_trip_all_backends() {
        let mut outputs = Vec::new();
        for builder in all_builders() {
            let ser =
                compile_serializer(builder.as_ref(), person_target(true), ctx_default()).unwrap();
            let bytes = ser.pack_to_vec(&alice()).unwrap();
            let back = ser.unpack_from_slice(&bytes).unwrap();
            assert_eq!(back, alice());
            outputs.push(bytes);
        }
        // Backend choice must not be observable on the wire.
        assert!(outputs.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn named_round_trip_all_backends() {
        let mut outputs = Vec::new();
        for builder in all_builders() {
            let ser =
                compile_serializer(builder.as_ref(), person_target(false), ctx_default()).unwrap();
            let bytes = ser.pack_to_vec(&alice()).unwrap();
            let back = ser.unpack_from_slice(&bytes).unwrap();
            assert_eq!(back, alice());
            outputs.push(bytes);
        }
        assert!(outputs.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn ordered_wire_matches_rmp() {
        let ser = compile_serializer(
            &GraphBuilder::default(),
            person_target(true),
            ctx_default(),
        )
        .unwrap();
        let bytes = ser.pack_to_vec(&alice()).unwrap();

        let mut oracle = Vec::new();
        rmp::encode::write_array_len(&mut oracle, 2).unwrap();
        rmp::encode::write_str(&mut oracle, "Alice").unwrap();
        rmp::encode::write_sint(&mut oracle, 30).unwrap();
        assert_eq!(bytes, oracle);
    }

    #[test]
    fn named_wire_matches_rmp() {
        let ser = compile_serializer(
            &GraphBuilder::default(),
            person_target(false),
            ctx_default(),
        )
        .unwrap();
        let bytes = ser.pack_to_vec(&alice()).unwrap();

        let mut oracle = Vec::new();
        rmp::encode::write_map_len(&mut oracle, 2).unwrap();
        rmp::encode::write_str(&mut oracle, "Name").unwrap();
        rmp::encode::write_str(&mut oracle, "Alice").unwrap();
        rmp::encode::write_str(&mut oracle, "Age").unwrap();
        rmp::encode::write_sint(&mut oracle, 30).unwrap();
        assert_eq!(bytes, oracle);
    }

    #[test]
    fn repeated_builds_are_deterministic() {
        let builder = GraphBuilder::default();
        let a = compile_serializer(&builder, person_target(true), ctx_default()).unwrap();
        let b = compile_serializer(&builder, person_target(true), ctx_default()).unwrap();
        assert_eq!(
            a.pack_to_vec(&alice()).unwrap(),
            b.pack_to_vec(&alice()).unwrap()
        );
    }

    #[test]
    fn collection_member_round_trip() {
        let tagged = Value::Seq(vec![Value::Seq(vec![
            Value::Str("a".to_owned()),
            Value::Str("b".to_owned()),
            Value::Str("c".to_owned()),
        ])]);
        for builder in all_builders() {
            let ser = compile_serializer(builder.as_ref(), tagged_target(), ctx_default()).unwrap();
            let bytes = ser.pack_to_vec(&tagged).unwrap();
            assert_eq!(ser.unpack_from_slice(&bytes).unwrap(), tagged);
        }
    }

    #[test]
    fn empty_collection_round_trip() {
        let tagged = Value::Seq(vec![Value::Seq(vec![])]);
        for builder in all_builders() {
            let ser = compile_serializer(builder.as_ref(), tagged_target(), ctx_default()).unwrap();
            let bytes = ser.pack_to_vec(&tagged).unwrap();
            assert_eq!(ser.unpack_from_slice(&bytes).unwrap(), tagged);
        }
    }

    #[test]
    fn short_array_leaves_trailing_members_nil() {
        let ser = compile_serializer(
            &GraphBuilder::default(),
            person_target(true),
            ctx_default(),
        )
        .unwrap();
        let mut bytes = Vec::new();
        rmp::encode::write_array_len(&mut bytes, 1).unwrap();
        rmp::encode::write_str(&mut bytes, "Bob").unwrap();
        let back = ser.unpack_from_slice(&bytes).unwrap();
        assert_eq!(
            back,
            Value::Seq(vec![Value::Str("Bob".to_owned()), Value::Nil])
        );
    }

    #[test]
    fn oversized_array_is_rejected() {
        let ser = compile_serializer(
            &GraphBuilder::default(),
            person_target(true),
            ctx_default(),
        )
        .unwrap();
        let mut bytes = Vec::new();
        rmp::encode::write_array_len(&mut bytes, 3).unwrap();
        rmp::encode::write_str(&mut bytes, "Bob").unwrap();
        rmp::encode::write_sint(&mut bytes, 1).unwrap();
        rmp::encode::write_sint(&mut bytes, 2).unwrap();
        assert!(ser.unpack_from_slice(&bytes).is_err());
    }

    #[test]
    fn huge_claimed_array_header_is_an_error() {
        let target = Arc::new(SerializationTarget {
            type_name: "Blob".to_owned(),
            members: vec![member("Items", 0, ValueType::Seq)],
            tuple_like: true,
            self_pack: None,
        });
        // One-element array whose nested header claims u32::MAX elements;
        // decoding must fail without a giant up-front allocation.
        let bytes = [0x91, 0xdd, 0xff, 0xff, 0xff, 0xff];
        for builder in all_builders() {
            let ser =
                compile_serializer(builder.as_ref(), target.clone(), ctx_default()).unwrap();
            assert!(matches!(
                ser.unpack_from_slice(&bytes),
                Err(CodecError::UnexpectedEof)
            ));
        }
    }

    #[test]
    fn unknown_map_keys_are_skipped() {
        let ser = compile_serializer(
            &GraphBuilder::default(),
            person_target(false),
            ctx_default(),
        )
        .unwrap();
        let mut bytes = Vec::new();
        rmp::encode::write_map_len(&mut bytes, 3).unwrap();
        rmp::encode::write_str(&mut bytes, "Age").unwrap();
        rmp::encode::write_sint(&mut bytes, 30).unwrap();
        rmp::encode::write_str(&mut bytes, "Nickname").unwrap();
        rmp::encode::write_str(&mut bytes, "Al").unwrap();
        rmp::encode::write_str(&mut bytes, "Name").unwrap();
        rmp::encode::write_str(&mut bytes, "Alice").unwrap();
        assert_eq!(ser.unpack_from_slice(&bytes).unwrap(), alice());
    }

    #[test]
    fn enum_by_name_round_trip() {
        for builder in all_builders() {
            let factory = builder.build_enum_serializer(color_enum()).unwrap();
            let ser = factory(ctx_default());
            let bytes = ser.pack_to_vec(&Value::Str("Green".to_owned())).unwrap();

            let mut oracle = Vec::new();
            rmp::encode::write_str(&mut oracle, "Green").unwrap();
            assert_eq!(bytes, oracle);
            assert_eq!(
                ser.unpack_from_slice(&bytes).unwrap(),
                Value::Str("Green".to_owned())
            );
        }
    }

    #[test]
    fn enum_by_underlying_value_round_trip() {
        let cx = Arc::new(SerializationContext {
            enum_method: Some(EnumSerializationMethod::ByUnderlyingValue),
        });
        for builder in all_builders() {
            let factory = builder.build_enum_serializer(color_enum()).unwrap();
            let ser = factory(cx.clone());
            let bytes = ser.pack_to_vec(&Value::Str("Blue".to_owned())).unwrap();

            let mut oracle = Vec::new();
            rmp::encode::write_sint(&mut oracle, 2).unwrap();
            assert_eq!(bytes, oracle);
            assert_eq!(
                ser.unpack_from_slice(&bytes).unwrap(),
                Value::Str("Blue".to_owned())
            );
        }
    }

    #[test]
    fn builder_config_enum_method_applies_when_context_is_silent() {
        let config = BuilderConfig {
            enum_method: EnumSerializationMethod::ByUnderlyingValue,
            dump_metadata: false,
        };
        let builders: Vec<Box<dyn SerializerBuilder>> = vec![
            Box::new(GraphBuilder::new(config.clone())),
            Box::new(OpcodeBuilder::with_config(
                Arc::new(ContainerManager::new()),
                ContainerMode::Fast,
                EmitterFlavor::FieldBased,
                config.clone(),
            )),
        ];
        let mut by_value = Vec::new();
        rmp::encode::write_sint(&mut by_value, 2).unwrap();
        let mut by_name = Vec::new();
        rmp::encode::write_str(&mut by_name, "Blue").unwrap();

        for builder in builders {
            let factory = builder.build_enum_serializer(color_enum()).unwrap();

            let ser = factory(ctx_default());
            assert_eq!(
                ser.pack_to_vec(&Value::Str("Blue".to_owned())).unwrap(),
                by_value
            );

            // An explicit context choice still wins over the builder default.
            let ser = factory(Arc::new(SerializationContext {
                enum_method: Some(EnumSerializationMethod::ByName),
            }));
            assert_eq!(
                ser.pack_to_vec(&Value::Str("Blue".to_owned())).unwrap(),
                by_name
            );
        }
    }

    #[test]
    fn enum_unpack_accepts_either_wire_form() {
        let factory = GraphBuilder::default()
            .build_enum_serializer(color_enum())
            .unwrap();
        let ser = factory(ctx_default());

        let mut as_name = Vec::new();
        rmp::encode::write_str(&mut as_name, "Red").unwrap();
        assert_eq!(
            ser.unpack_from_slice(&as_name).unwrap(),
            Value::Str("Red".to_owned())
        );

        let mut as_int = Vec::new();
        rmp::encode::write_sint(&mut as_int, 1).unwrap();
        assert_eq!(
            ser.unpack_from_slice(&as_int).unwrap(),
            Value::Str("Green".to_owned())
        );
    }

    #[test]
    fn unknown_enum_member_is_rejected() {
        let factory = GraphBuilder::default()
            .build_enum_serializer(color_enum())
            .unwrap();
        let ser = factory(ctx_default());
        assert!(matches!(
            ser.pack_to_vec(&Value::Str("Mauve".to_owned())),
            Err(CodecError::UnknownEnumMember(_))
        ));

        let mut bytes = Vec::new();
        rmp::encode::write_sint(&mut bytes, 9).unwrap();
        assert!(matches!(
            ser.unpack_from_slice(&bytes),
            Err(CodecError::UnknownEnumMember(_))
        ));
    }

    #[test]
    fn self_packing_target_defers_to_its_routines() {
        let target = Arc::new(SerializationTarget {
            type_name: "Stamp".to_owned(),
            members: vec![],
            tuple_like: false,
            self_pack: Some(SelfPack {
                pack: Arc::new(|enc, _| enc.write_str("stamped")),
                unpack: Arc::new(|dec| Ok(Value::Str(dec.read_str()?))),
            }),
        });
        for builder in all_builders() {
            let ser =
                compile_serializer(builder.as_ref(), target.clone(), ctx_default()).unwrap();
            let bytes = ser.pack_to_vec(&Value::Nil).unwrap();
            let mut oracle = Vec::new();
            rmp::encode::write_str(&mut oracle, "stamped").unwrap();
            assert_eq!(bytes, oracle);
            assert_eq!(
                ser.unpack_from_slice(&bytes).unwrap(),
                Value::Str("stamped".to_owned())
            );
        }
    }

    #[test]
    fn schema_is_threaded_through() {
        let schema = Arc::new(PolymorphismSchema {
            label: "kind".to_owned(),
        });
        let factory = GraphBuilder::default()
            .build_serializer(person_target(false), Some(schema.clone()))
            .unwrap();
        let ser = factory(ctx_default());
        assert_eq!(ser.schema().unwrap().label, "kind");
    }

    // ─── Context state machine ────────────────────────────────────────────

    #[test]
    fn emission_after_finish_is_rejected() {
        let mut ctx = GenContext::new(BuilderConfig::default());
        ctx.finish().unwrap();
        assert_eq!(ctx.state(), BuildState::Finished);
        let gb = GraphBuilder::default();
        assert!(matches!(
            gb.emit_constant(&mut ctx, Value::Int(1)),
            Err(BuildError::InvalidState {
                operation: "emit",
                state: "finished"
            })
        ));
    }

    #[test]
    fn finish_twice_is_rejected() {
        let mut ctx = GenContext::new(BuilderConfig::default());
        ctx.finish().unwrap();
        assert!(matches!(
            ctx.finish(),
            Err(BuildError::InvalidState {
                operation: "finish",
                ..
            })
        ));
    }

    #[test]
    fn locals_are_declared_once_per_name() {
        let mut ctx = GenContext::new(BuilderConfig::default());
        let ty = ExprType::Value(ValueType::Int);
        let (a, fresh_a) = ctx.declare_local("i", ty).unwrap();
        let (b, fresh_b) = ctx.declare_local("i", ty).unwrap();
        assert_eq!(a, b);
        assert!(fresh_a);
        assert!(!fresh_b);
        assert_eq!(ctx.local_count(), 1);
    }

    #[test]
    fn name_only_resolution_of_overload_is_ambiguous() {
        assert!(matches!(
            intrinsics::resolve("pack_int", None),
            Err(BuildError::AmbiguousMember { candidates: 2, .. })
        ));
        // Argument types disambiguate.
        let int_args = [ExprType::Value(ValueType::Int)];
        assert!(intrinsics::resolve("pack_int", Some(&int_args)).is_ok());
    }

    #[test]
    fn unknown_method_reference_is_unresolved() {
        let mut ctx = GenContext::new(BuilderConfig::default());
        let gb = GraphBuilder::default();
        assert!(matches!(
            gb.emit_get_private_method_delegate(&mut ctx, "no_such_method"),
            Err(BuildError::UnresolvedMember { .. })
        ));
    }

    #[test]
    fn inconsistent_graph_fails_compilation() {
        let mut ctx = GenContext::new(BuilderConfig::default());
        let gb = GraphBuilder::default();
        let cond = gb.emit_constant(&mut ctx, Value::Int(1)).unwrap();
        // Bypass the checked surface to plant an integer condition.
        let bad = ctx
            .push_node(TypedNode {
                expr: ExprNode::If {
                    cond,
                    then_branch: cond,
                    else_branch: None,
                },
                ty: ExprType::Void,
            })
            .unwrap();
        ctx.finish().unwrap();
        let mut compiler = Compiler::new(&ctx, None);
        assert!(matches!(
            compiler.compile_root(bad),
            Err(BuildError::Compilation(_))
        ));
    }

    // ─── Graph operation surface ──────────────────────────────────────────

    fn compile_and_run(ctx: &GenContext, root: NodeId) -> Result<RtVal, CodecError> {
        let mut compiler = Compiler::new(ctx, None);
        let method = compiler.compile_root(root).unwrap();
        method.run(ThisRef::None, Machine::Idle, vec![])
    }

    fn val(rt: RtVal) -> Value {
        match rt {
            RtVal::Val(v) => v,
            _ => panic!("expected a value result"),
        }
    }

    #[test]
    fn and_also_short_circuits() {
        let gb = GraphBuilder::default();
        let mut ctx = GenContext::new(BuilderConfig::default());
        let lhs = gb.emit_constant(&mut ctx, Value::Bool(false)).unwrap();
        // The right side would fail outside an unpack operation, so the
        // result is only false if it never runs.
        let read = gb.emit_call(&mut ctx, "unpack_int", vec![]).unwrap();
        let zero = gb.emit_constant(&mut ctx, Value::Int(0)).unwrap();
        let rhs = gb.emit_equal(&mut ctx, read, zero).unwrap();
        let root = gb.emit_and_also(&mut ctx, lhs, rhs).unwrap();
        ctx.finish().unwrap();
        assert_eq!(
            val(compile_and_run(&ctx, root).unwrap()),
            Value::Bool(false)
        );
    }

    #[test]
    fn try_finally_prefers_the_body_error() {
        let gb = GraphBuilder::default();
        let mut ctx = GenContext::new(BuilderConfig::default());
        let body = gb.emit_call(&mut ctx, "unpack_int", vec![]).unwrap();
        let one = gb.emit_constant(&mut ctx, Value::Int(1)).unwrap();
        let finalizer = gb.emit_call(&mut ctx, "pack_int", vec![one]).unwrap();
        let root = gb.emit_try_finally(&mut ctx, body, finalizer).unwrap();
        ctx.finish().unwrap();
        // Both fail under an idle machine; the body error must surface.
        match compile_and_run(&ctx, root) {
            Err(CodecError::Message(msg)) => assert!(msg.contains("unpack")),
            _ => panic!("expected the body error"),
        }
    }

    #[test]
    fn try_finally_runs_the_finalizer_on_success() {
        let gb = GraphBuilder::default();
        let mut ctx = GenContext::new(BuilderConfig::default());
        let body = gb.emit_constant(&mut ctx, Value::Int(1)).unwrap();
        let one = gb.emit_constant(&mut ctx, Value::Int(1)).unwrap();
        let finalizer = gb.emit_call(&mut ctx, "pack_int", vec![one]).unwrap();
        let root = gb.emit_try_finally(&mut ctx, body, finalizer).unwrap();
        ctx.finish().unwrap();
        match compile_and_run(&ctx, root) {
            Err(CodecError::Message(msg)) => assert!(msg.contains("pack")),
            _ => panic!("expected the finalizer to run and fail"),
        }
    }

    #[test]
    fn set_indexed_inserts_and_overwrites() {
        let gb = GraphBuilder::default();
        let mut ctx = GenContext::new(BuilderConfig::default());
        let (m, _) = ctx
            .declare_local("m", ExprType::Value(ValueType::Map))
            .unwrap();
        let empty = gb.emit_constant(&mut ctx, Value::Map(vec![])).unwrap();
        let init = gb.emit_store_local(&mut ctx, m, empty).unwrap();
        let key = gb
            .emit_constant(&mut ctx, Value::Str("k".to_owned()))
            .unwrap();
        let one = gb.emit_constant(&mut ctx, Value::Int(1)).unwrap();
        let first = gb.emit_set_indexed(&mut ctx, m, key, one).unwrap();
        let key_again = gb
            .emit_constant(&mut ctx, Value::Str("k".to_owned()))
            .unwrap();
        let two = gb.emit_constant(&mut ctx, Value::Int(2)).unwrap();
        let second = gb.emit_set_indexed(&mut ctx, m, key_again, two).unwrap();
        let read = gb.emit_local(&mut ctx, m).unwrap();
        let root = gb
            .emit_sequential_statements(
                &mut ctx,
                ExprType::Value(ValueType::Map),
                vec![Some(init), Some(first), Some(second), Some(read)],
            )
            .unwrap();
        ctx.finish().unwrap();
        assert_eq!(
            val(compile_and_run(&ctx, root).unwrap()),
            Value::Map(vec![(Value::Str("k".to_owned()), Value::Int(2))])
        );
    }

    #[test]
    fn construct_builds_a_record_in_member_order() {
        let gb = GraphBuilder::default();
        let mut ctx = GenContext::new(BuilderConfig::default());
        let name = gb
            .emit_constant(&mut ctx, Value::Str("Ada".to_owned()))
            .unwrap();
        let age = gb.emit_constant(&mut ctx, Value::Int(36)).unwrap();
        let root = gb.emit_construct(&mut ctx, vec![name, age]).unwrap();
        ctx.finish().unwrap();
        let target = person_target(true);
        let mut compiler = Compiler::new(&ctx, Some(&target));
        let method = compiler.compile_root(root).unwrap();
        let built = method.run(ThisRef::None, Machine::Idle, vec![]).unwrap();
        assert_eq!(
            val(built),
            Value::Seq(vec![Value::Str("Ada".to_owned()), Value::Int(36)])
        );
    }

    #[test]
    fn private_method_delegates_are_invocable() {
        let gb = GraphBuilder::default();
        let mut ctx = GenContext::new(BuilderConfig::default());
        ctx.set_params(vec![ExprType::Value(ValueType::Any)])
            .unwrap();
        let body = gb.emit_param(&mut ctx, 0).unwrap();
        let del = gb
            .emit_new_private_method_delegate(
                &mut ctx,
                "echo",
                vec![ExprType::Value(ValueType::Any)],
                ExprType::Value(ValueType::Any),
                body,
            )
            .unwrap();
        let arg = gb
            .emit_constant(&mut ctx, Value::Str("ping".to_owned()))
            .unwrap();
        let root = gb
            .emit_invoke_delegate(&mut ctx, del, vec![arg], ExprType::Value(ValueType::Any))
            .unwrap();
        ctx.finish().unwrap();
        assert_eq!(
            val(compile_and_run(&ctx, root).unwrap()),
            Value::Str("ping".to_owned())
        );
    }

    #[test]
    fn array_index_reads_by_position() {
        let gb = GraphBuilder::default();
        let mut ctx = GenContext::new(BuilderConfig::default());
        let a = gb.emit_constant(&mut ctx, Value::Int(10)).unwrap();
        let b = gb.emit_constant(&mut ctx, Value::Int(20)).unwrap();
        let arr = gb
            .emit_new_array(&mut ctx, ExprType::Value(ValueType::Any), vec![a, b])
            .unwrap();
        let ix = gb.emit_constant(&mut ctx, Value::Uint(1)).unwrap();
        let root = gb.emit_array_index(&mut ctx, arr, ix).unwrap();
        ctx.finish().unwrap();
        assert_eq!(val(compile_and_run(&ctx, root).unwrap()), Value::Int(20));
    }

    #[test]
    fn static_delegate_fields_resolve_to_backing_methods() {
        let gb = GraphBuilder::default();
        let mut ctx = GenContext::new(BuilderConfig::default());
        let seven = gb.emit_constant(&mut ctx, Value::Int(7)).unwrap();
        ctx.define_private_method("checksum", vec![], ExprType::Value(ValueType::Int), seven)
            .unwrap();
        let del = gb.emit_get_static_delegate(&mut ctx, "checksum").unwrap();
        // Referencing the field twice keeps a single registration.
        gb.emit_get_static_delegate(&mut ctx, "checksum").unwrap();
        assert!(ctx.has_delegate_field("checksum"));
        assert_eq!(ctx.delegate_field_names().count(), 1);
        let root = gb
            .emit_invoke_delegate(&mut ctx, del, vec![], ExprType::Value(ValueType::Int))
            .unwrap();
        ctx.finish().unwrap();

        let mut compiler = Compiler::new(&ctx, None);
        for name in ctx.delegate_field_names() {
            compiler.compile_private_method(name).unwrap();
        }
        let method = compiler.compile_root(root).unwrap();
        assert_eq!(
            val(method.run(ThisRef::None, Machine::Idle, vec![]).unwrap()),
            Value::Int(7)
        );
    }

    #[test]
    fn unbacked_static_delegate_field_fails_the_build() {
        let gb = GraphBuilder::default();
        let mut ctx = GenContext::new(BuilderConfig::default());
        gb.emit_get_static_delegate(&mut ctx, "missing_helper")
            .unwrap();
        assert!(matches!(
            gb.create_serializer_constructor(ctx, person_target(true), None),
            Err(BuildError::UnresolvedMember { .. })
        ));
    }

    #[test]
    fn for_each_owns_its_cursor_local() {
        let gb = GraphBuilder::default();
        let mut ctx = GenContext::new(BuilderConfig::default());
        let traits = ctx.register_traits(Arc::new(CollectionTraits::for_seq(ValueType::Str)));
        let (total, _) = ctx
            .declare_local("total", ExprType::Value(ValueType::Int))
            .unwrap();
        let coll = gb.emit_constant(&mut ctx, Value::Seq(vec![])).unwrap();
        let each = gb
            .emit_for_each(&mut ctx, traits, coll, |_, _, current| Ok(current))
            .unwrap();
        let root = gb
            .emit_sequential_statements(&mut ctx, ExprType::Void, vec![Some(each)])
            .unwrap();
        // The loop's block owns the cursor; the outer block adopts only the
        // caller's own local.
        match &ctx.node(each).expr {
            ExprNode::Block { locals, .. } => assert_eq!(locals.len(), 1),
            _ => panic!("loop did not lower to a block"),
        }
        match &ctx.node(root).expr {
            ExprNode::Block { locals, .. } => assert_eq!(locals, &vec![total]),
            _ => panic!("sequence did not lower to a block"),
        }
    }

    // ─── Containers and emitters ──────────────────────────────────────────

    #[test]
    fn disabled_containers_fail_and_graph_backend_still_works() {
        let caps = Capabilities {
            dynamic_containers: false,
            field_emitters: true,
            context_emitters: true,
        };
        let manager = Arc::new(ContainerManager::with_capabilities(caps));
        let builder = OpcodeBuilder::new(manager, ContainerMode::Fast, EmitterFlavor::FieldBased);
        assert!(matches!(
            builder.build_serializer(person_target(true), None),
            Err(BuildError::PlatformUnsupported(_))
        ));

        // The recovery path: no container dependency at all.
        let ser = compile_serializer(
            &GraphBuilder::default(),
            person_target(true),
            ctx_default(),
        )
        .unwrap();
        assert!(ser.pack_to_vec(&alice()).is_ok());
    }

    #[test]
    fn unsupported_flavor_is_substituted_when_possible() {
        let caps = Capabilities {
            dynamic_containers: true,
            field_emitters: false,
            context_emitters: true,
        };
        let manager = ContainerManager::with_capabilities(caps);
        let container = manager.container(ContainerMode::Fast).unwrap();
        let emitter = manager
            .emitter(&container, "Person", EmitterFlavor::FieldBased)
            .unwrap();
        assert_eq!(emitter.flavor(), EmitterFlavor::ContextBased);
    }

    #[test]
    fn no_supported_flavor_is_an_error() {
        let caps = Capabilities {
            dynamic_containers: true,
            field_emitters: false,
            context_emitters: false,
        };
        let manager = ContainerManager::with_capabilities(caps);
        let container = manager.container(ContainerMode::Fast).unwrap();
        assert!(matches!(
            manager.emitter(&container, "Person", EmitterFlavor::FieldBased),
            Err(BuildError::UnsupportedFlavor(EmitterFlavor::FieldBased))
        ));
    }

    #[test]
    fn containers_are_singletons_per_mode() {
        let manager = ContainerManager::new();
        let a = manager.container(ContainerMode::Fast).unwrap();
        let b = manager.container(ContainerMode::Fast).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        let c = manager.container(ContainerMode::Debuggable).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert_ne!(a.name(), c.name());
    }

    #[test]
    fn refresh_yields_fresh_containers_with_new_names() {
        let manager = ContainerManager::new();
        let before = manager.container(ContainerMode::Fast).unwrap();
        manager.refresh();
        let after = manager.container(ContainerMode::Fast).unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
        assert_ne!(before.name(), after.name());
    }

    #[test]
    fn serializers_survive_refresh() {
        let manager = Arc::new(ContainerManager::new());
        let builder = OpcodeBuilder::new(
            manager.clone(),
            ContainerMode::Fast,
            EmitterFlavor::FieldBased,
        );
        let ser = compile_serializer(&builder, person_target(true), ctx_default()).unwrap();
        manager.refresh();
        let bytes = ser.pack_to_vec(&alice()).unwrap();
        assert_eq!(ser.unpack_from_slice(&bytes).unwrap(), alice());
    }

    #[test]
    fn debuggable_container_persists_listings() {
        let manager = Arc::new(ContainerManager::new());
        let builder = OpcodeBuilder::new(
            manager.clone(),
            ContainerMode::Debuggable,
            EmitterFlavor::FieldBased,
        );
        let _ser = compile_serializer(&builder, person_target(true), ctx_default()).unwrap();
        let container = manager.container(ContainerMode::Debuggable).unwrap();
        assert!(container.has_debug_symbols());
        assert_eq!(container.program_count(), 4);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("serializers.lst");
        container.persist(&path).unwrap();
        let listing = std::fs::read_to_string(&path).unwrap();
        assert!(listing.contains("pack_Name"));
        assert!(listing.contains("unpack_Age"));
    }

    #[test]
    fn fast_container_refuses_to_persist() {
        let manager = ContainerManager::new();
        let container = manager.container(ContainerMode::Fast).unwrap();
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            container.persist(&dir.path().join("out.lst")),
            Err(BuildError::InvalidState {
                operation: "persist",
                ..
            })
        ));
    }

    // ─── Wire format oracle ───────────────────────────────────────────────

    #[test]
    fn msgpack_scalars_match_rmp() {
        let cases: Vec<(Value, Vec<u8>)> = vec![
            (Value::Nil, {
                let mut v = Vec::new();
                rmp::encode::write_nil(&mut v).unwrap();
                v
            }),
            (Value::Bool(true), {
                let mut v = Vec::new();
                rmp::encode::write_bool(&mut v, true).unwrap();
                v
            }),
            (Value::Int(-5), {
                let mut v = Vec::new();
                rmp::encode::write_sint(&mut v, -5).unwrap();
                v
            }),
            (Value::Int(300), {
                let mut v = Vec::new();
                rmp::encode::write_sint(&mut v, 300).unwrap();
                v
            }),
            (Value::Uint(u64::MAX), {
                let mut v = Vec::new();
                rmp::encode::write_uint(&mut v, u64::MAX).unwrap();
                v
            }),
            (Value::F64(1.5), {
                let mut v = Vec::new();
                rmp::encode::write_f64(&mut v, 1.5).unwrap();
                v
            }),
            (Value::Str("hello".to_owned()), {
                let mut v = Vec::new();
                rmp::encode::write_str(&mut v, "hello").unwrap();
                v
            }),
        ];
        for (value, oracle) in cases {
            let mut buf = Vec::new();
            {
                let mut enc = msgpack::MsgPackEncoder::new(&mut buf);
                intrinsics::pack_as(&mut enc, &value, ValueType::Any).unwrap();
            }
            assert_eq!(buf, oracle, "wire mismatch for {value:?}");
        }
    }

    #[test]
    fn msgpack_round_trips_dynamic_values() {
        let value = Value::Map(vec![
            (
                Value::Str("xs".to_owned()),
                Value::Seq(vec![Value::Uint(1), Value::Bool(false), Value::Nil]),
            ),
            (Value::Str("f".to_owned()), Value::F64(2.25)),
        ]);
        let mut buf = Vec::new();
        {
            let mut enc = msgpack::MsgPackEncoder::new(&mut buf);
            intrinsics::pack_as(&mut enc, &value, ValueType::Any).unwrap();
        }
        let mut dec = msgpack::MsgPackDecoder::new(&buf);
        let back = intrinsics::unpack_as(&mut dec, ValueType::Any).unwrap();
        assert_eq!(back, value);
    }
}
