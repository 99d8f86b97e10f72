//! Candidate and stored article records

mod candidate;
mod fingerprint;
mod stored;

pub use candidate::CandidateArticle;
pub use fingerprint::{fingerprint, normalize_url};
pub use stored::{ArticleId, EnrichmentStatus, NewArticle, StoredArticle};
