//! Command dispatch table.
//!
//! Maps a wire type tag to its metadata and to monomorphized decode /
//! derive functions, so the backend and the client can turn a field bag
//! back into a typed command without knowing the type statically.

use crate::codec::decode_fields;
use crate::command::{AnyCommand, CommandMetadata, ExecutionMode, GameCommand};
use crate::consensus::ConsensusCommand;
use crate::error::{DispatchError, FieldError};
use crate::frame::{Derived, FrameDerivationAdapter, FrameDerived};
use crate::router::Capabilities;
use statelink_env::{FieldBag, MatchId, PlayerId};
use std::collections::HashMap;
use tracing::warn;

type DecodeFn = fn(&FieldBag) -> Result<Box<dyn AnyCommand>, FieldError>;
type InitFn = fn() -> Box<dyn AnyCommand>;
type TriggerFn = fn(&FieldBag) -> Result<MatchId, FieldError>;
type DeriveFn =
    fn(&FrameDerivationAdapter, &FieldBag, PlayerId) -> Result<Derived<Box<dyn AnyCommand>>, DispatchError>;
type ConsensusDecodeFn = fn(&FieldBag) -> Result<Box<dyn ConsensusCommand>, FieldError>;

/// Frame-derivation entry points of one type.
#[derive(Clone, Copy)]
pub struct FrameHooks {
    pub trigger: TriggerFn,
    pub derive: DeriveFn,
}

/// Everything the dispatcher knows about one command type.
#[derive(Clone, Copy)]
pub struct CommandHandler {
    pub metadata: CommandMetadata,
    pub decode: DecodeFn,
    pub init: Option<InitFn>,
    pub frame: Option<FrameHooks>,
    pub consensus: Option<ConsensusDecodeFn>,
}

impl CommandHandler {
    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            frame_derived: self.frame.is_some(),
            consensus: self.consensus.is_some(),
        }
    }
}

fn decode_boxed<C: GameCommand>(fields: &FieldBag) -> Result<Box<dyn AnyCommand>, FieldError> {
    Ok(Box::new(decode_fields::<C>(fields)?))
}

fn init_boxed<C: GameCommand + Default>() -> Box<dyn AnyCommand> {
    Box::new(C::default())
}

fn derive_boxed<C: FrameDerived>(
    adapter: &FrameDerivationAdapter,
    fields: &FieldBag,
    player: PlayerId,
) -> Result<Derived<Box<dyn AnyCommand>>, DispatchError> {
    let derived = adapter.derive::<C>(fields, player)?;
    Ok(Derived {
        derivation: derived
            .derivation
            .map(|command| Box::new(command) as Box<dyn AnyCommand>),
        values: derived.values,
    })
}

fn decode_consensus<C: ConsensusCommand + GameCommand>(
    fields: &FieldBag,
) -> Result<Box<dyn ConsensusCommand>, FieldError> {
    Ok(Box::new(decode_fields::<C>(fields)?))
}

/// Type tag → handler.
#[derive(Default, Clone)]
pub struct CommandRegistry {
    handlers: HashMap<&'static str, CommandHandler>,
    initialization: Vec<&'static str>,
}

impl CommandRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn get(&self, type_tag: &str) -> Option<&CommandHandler> {
        self.handlers.get(type_tag)
    }

    /// Initialization commands in registration order.
    pub fn initialization(&self) -> impl Iterator<Item = &CommandHandler> {
        self.initialization
            .iter()
            .filter_map(|tag| self.handlers.get(tag))
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[derive(Default)]
pub struct RegistryBuilder {
    registry: CommandRegistry,
}

impl RegistryBuilder {
    /// Registers a plain command type.
    pub fn command<C: GameCommand>(mut self) -> Self {
        self.insert(CommandHandler {
            metadata: C::METADATA,
            decode: decode_boxed::<C>,
            init: None,
            frame: None,
            consensus: None,
        });
        self
    }

    /// Registers a type run once per session before anything else.
    pub fn initialization<C: GameCommand + Default>(mut self) -> Self {
        if C::METADATA.mode != ExecutionMode::Initialization {
            warn!(command = C::METADATA.type_tag, "registered as initialization but declares another mode");
        }
        self.insert(CommandHandler {
            metadata: C::METADATA,
            decode: decode_boxed::<C>,
            init: Some(init_boxed::<C>),
            frame: None,
            consensus: None,
        });
        self.registry.initialization.push(C::METADATA.type_tag);
        self
    }

    /// Adds frame derivation to a simulation-authoritative type.
    pub fn frame_derived<C: FrameDerived>(mut self) -> Self {
        let mut handler = self.take_or_new::<C>();
        handler.frame = Some(FrameHooks {
            trigger: C::trigger,
            derive: derive_boxed::<C>,
        });
        self.insert(handler);
        self
    }

    /// Adds consensus resolution to a simulation-authoritative type.
    pub fn consensus<C: ConsensusCommand + GameCommand>(mut self) -> Self {
        let mut handler = self.take_or_new::<C>();
        handler.consensus = Some(decode_consensus::<C>);
        self.insert(handler);
        self
    }

    pub fn build(self) -> CommandRegistry {
        self.registry
    }

    fn take_or_new<C: GameCommand>(&mut self) -> CommandHandler {
        self.registry
            .handlers
            .remove(C::METADATA.type_tag)
            .unwrap_or(CommandHandler {
                metadata: C::METADATA,
                decode: decode_boxed::<C>,
                init: None,
                frame: None,
                consensus: None,
            })
    }

    fn insert(&mut self, handler: CommandHandler) {
        self.registry
            .handlers
            .insert(handler.metadata.type_tag, handler);
    }
}
