// THEORY:
// Contracts for everything the pipeline does not implement itself, and the
// bundle the driver is constructed with.

pub mod codec;
pub mod features;
pub mod search;
pub mod store;

use std::sync::Arc;

use crate::core_modules::filter::{FilterPredicate, FirstByteParity};
use crate::core_modules::placement::{DefaultPlacement, PlacementPolicy};

use self::codec::{Codec, ImageCodec};
use self::features::{FeatureBackend, NormalizePreprocessor, Preprocessor};
use self::search::{NeighborSearch, NoopSearch};
use self::store::ObjectStore;

/// The adapters one run talks to. Only the store and the backend have no
/// sensible default.
#[derive(Debug, Clone)]
pub struct Collaborators {
    pub store: Arc<dyn ObjectStore>,
    pub codec: Arc<dyn Codec>,
    pub preprocessor: Arc<dyn Preprocessor>,
    pub backend: Arc<dyn FeatureBackend>,
    pub search: Arc<dyn NeighborSearch>,
    pub predicate: Arc<dyn FilterPredicate>,
    pub placement: Arc<dyn PlacementPolicy>,
}

impl Collaborators {
    pub fn new(store: Arc<dyn ObjectStore>, backend: Arc<dyn FeatureBackend>) -> Self {
        Self {
            store,
            codec: Arc::new(ImageCodec::default()),
            preprocessor: Arc::new(NormalizePreprocessor::default()),
            backend,
            search: Arc::new(NoopSearch),
            predicate: Arc::new(FirstByteParity),
            placement: Arc::new(DefaultPlacement),
        }
    }

    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_preprocessor(mut self, preprocessor: Arc<dyn Preprocessor>) -> Self {
        self.preprocessor = preprocessor;
        self
    }

    pub fn with_search(mut self, search: Arc<dyn NeighborSearch>) -> Self {
        self.search = search;
        self
    }

    pub fn with_predicate(mut self, predicate: Arc<dyn FilterPredicate>) -> Self {
        self.predicate = predicate;
        self
    }

    pub fn with_placement(mut self, placement: Arc<dyn PlacementPolicy>) -> Self {
        self.placement = placement;
        self
    }
}
