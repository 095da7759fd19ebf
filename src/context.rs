//! Serialization context and build configuration.

/// How enum-shaped targets are written to the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnumSerializationMethod {
    /// Pack the member name as a string. Default.
    ByName,
    /// Pack the underlying integer value.
    ByUnderlyingValue,
}

/// Process-wide serialization configuration. One instance is passed into
/// every factory call; each call yields an independently usable serializer
/// bound to that context.
#[derive(Debug, Clone, Default)]
pub struct SerializationContext {
    /// Overrides the builder-configured enum strategy when set.
    pub enum_method: Option<EnumSerializationMethod>,
}

/// Context-wide configuration consulted while building, baked into the
/// factories a build produces.
#[derive(Debug, Clone)]
pub struct BuilderConfig {
    /// Enum strategy baked into enum serializer factories.
    pub enum_method: EnumSerializationMethod,
    /// When set, metadata literals resolve to stable named references
    /// instead of raw handles, so persisted output remains inspectable.
    pub dump_metadata: bool,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        BuilderConfig {
            enum_method: EnumSerializationMethod::ByName,
            dump_metadata: false,
        }
    }
}
