//! Cache-eligible context prefix construction
//!
//! The upstream model's prompt caching is keyed on byte-for-byte prefix
//! equality, so the assembled context must be deterministic: documents are
//! concatenated in ascending document-id order behind a fixed instruction
//! preamble. Expiry is a lazy check-on-access; there is no timer task.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;
use xxhash_rust::xxh3::xxh3_128;

use super::knowledge::{KnowledgeContext, estimate_tokens};

/// Estimated token count at which a prefix is worth flagging for upstream
/// caching. Below this the context is still sent, just not flagged.
pub const CACHE_MIN_TOKENS: usize = 1024;

/// Default prefix lifetime, matching the upstream cache window.
pub const DEFAULT_CONTEXT_TTL: Duration = Duration::from_secs(3600);

/// Fixed instruction block that precedes the knowledge corpus.
const INSTRUCTION_PREAMBLE: &str = "\
You are a helpful voice assistant with access to a private knowledge base.

Guidelines:
- Ground answers in the knowledge base content whenever it is relevant.
- Keep responses conversational and concise; they will be spoken aloud.
- If the knowledge base does not cover a question, say so plainly.
- Maintain a friendly, professional tone.
";

const KNOWLEDGE_BANNER: &str = "\nKNOWLEDGE BASE:\n";

/// The assembled context prefix for one session.
#[derive(Debug, Clone)]
pub struct CachedPrefix {
    /// Preamble plus document sections, in deterministic order.
    pub content: String,
    /// Document token estimate plus preamble estimate.
    pub token_count: usize,
    /// Token estimate of the documents alone; this is what eligibility is
    /// judged on, since the preamble is constant overhead that exists even
    /// with an empty corpus.
    pub knowledge_tokens: usize,
    /// Whether the prefix should be flagged for upstream caching.
    pub cache_eligible: bool,
    pub created_at: Instant,
    pub expires_at: Instant,
    /// xxh3-128 fingerprint of `content`, for log correlation and for
    /// verifying that a rebuild over an unchanged corpus reproduced the
    /// same bytes.
    pub content_hash: u128,
}

impl CachedPrefix {
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    pub fn hash_hex(&self) -> String {
        format!("{:032x}", self.content_hash)
    }
}

/// Builds and lazily refreshes a session's [`CachedPrefix`].
#[derive(Debug, Clone)]
pub struct ContextCacheBuilder {
    ttl: Duration,
}

impl Default for ContextCacheBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_CONTEXT_TTL)
    }
}

impl ContextCacheBuilder {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl }
    }

    /// Return the stored prefix if still fresh, otherwise rebuild it from
    /// the session's documents and store the replacement.
    pub fn get_or_build(
        &self,
        slot: &mut Option<Arc<CachedPrefix>>,
        documents: &[KnowledgeContext],
    ) -> Arc<CachedPrefix> {
        self.get_or_build_at(slot, documents, Instant::now())
    }

    /// Clock-explicit variant of [`get_or_build`](Self::get_or_build); the
    /// expiry decision is `now >= expires_at`.
    pub fn get_or_build_at(
        &self,
        slot: &mut Option<Arc<CachedPrefix>>,
        documents: &[KnowledgeContext],
        now: Instant,
    ) -> Arc<CachedPrefix> {
        if let Some(existing) = slot.as_ref() {
            if !existing.is_expired_at(now) {
                return existing.clone();
            }
            let rebuilt = Arc::new(self.build_at(documents, now));
            if rebuilt.content_hash == existing.content_hash {
                debug!(
                    "Context prefix expired, rebuild reproduced identical content ({})",
                    rebuilt.hash_hex()
                );
            } else {
                debug!(
                    "Context prefix expired, content changed {} -> {}",
                    existing.hash_hex(),
                    rebuilt.hash_hex()
                );
            }
            *slot = Some(rebuilt.clone());
            return rebuilt;
        }

        let built = Arc::new(self.build_at(documents, now));
        debug!(
            "Built context prefix: {} tokens ({} knowledge), cache_eligible={}, hash={}",
            built.token_count,
            built.knowledge_tokens,
            built.cache_eligible,
            built.hash_hex()
        );
        *slot = Some(built.clone());
        built
    }

    /// Assemble a prefix from scratch. Pure apart from the clock argument:
    /// the same document set yields byte-identical content regardless of
    /// input order.
    pub fn build_at(&self, documents: &[KnowledgeContext], now: Instant) -> CachedPrefix {
        let mut ordered: Vec<&KnowledgeContext> = documents.iter().collect();
        ordered.sort_by(|a, b| a.document_id.cmp(&b.document_id));

        let mut content = String::from(INSTRUCTION_PREAMBLE);
        let mut knowledge_tokens = 0usize;

        if !ordered.is_empty() {
            content.push_str(KNOWLEDGE_BANNER);
            for doc in &ordered {
                content.push_str("\n[document: ");
                content.push_str(&doc.document_id);
                content.push_str("]\n");
                content.push_str(&doc.text);
                content.push('\n');
                knowledge_tokens += doc.estimated_tokens;
            }
        }

        let token_count = knowledge_tokens + estimate_tokens(INSTRUCTION_PREAMBLE);
        let content_hash = xxh3_128(content.as_bytes());

        CachedPrefix {
            content,
            token_count,
            knowledge_tokens,
            cache_eligible: knowledge_tokens >= CACHE_MIN_TOKENS,
            created_at: now,
            expires_at: now + self.ttl,
            content_hash,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str, chars: usize) -> KnowledgeContext {
        KnowledgeContext::new(id, "x".repeat(chars))
    }

    fn builder() -> ContextCacheBuilder {
        ContextCacheBuilder::default()
    }

    #[test]
    fn test_build_is_deterministic_across_input_order() {
        let forward = vec![doc("alpha", 400), doc("beta", 400), doc("gamma", 400)];
        let mut reversed = forward.clone();
        reversed.reverse();

        let now = Instant::now();
        let a = builder().build_at(&forward, now);
        let b = builder().build_at(&reversed, now);

        assert_eq!(a.content, b.content);
        assert_eq!(a.content_hash, b.content_hash);
    }

    #[test]
    fn test_documents_appear_in_id_order() {
        let docs = vec![doc("zeta", 40), doc("alpha", 40)];
        let prefix = builder().build_at(&docs, Instant::now());

        let alpha_pos = prefix.content.find("[document: alpha]").unwrap();
        let zeta_pos = prefix.content.find("[document: zeta]").unwrap();
        assert!(alpha_pos < zeta_pos);
        assert!(prefix.content.starts_with(INSTRUCTION_PREAMBLE));
    }

    #[test]
    fn test_eligibility_at_threshold() {
        // 4096 chars estimate to exactly 1024 tokens.
        let at = builder().build_at(&[doc("a", 4096)], Instant::now());
        assert_eq!(at.knowledge_tokens, CACHE_MIN_TOKENS);
        assert!(at.cache_eligible);

        // 4092 chars estimate to 1023 tokens.
        let below = builder().build_at(&[doc("a", 4092)], Instant::now());
        assert_eq!(below.knowledge_tokens, CACHE_MIN_TOKENS - 1);
        assert!(!below.cache_eligible);
        assert!(!below.content.is_empty());
    }

    #[test]
    fn test_eligibility_sums_across_documents() {
        let docs = vec![doc("a", 2048), doc("b", 2048)];
        let prefix = builder().build_at(&docs, Instant::now());
        assert_eq!(prefix.knowledge_tokens, 1024);
        assert!(prefix.cache_eligible);
    }

    #[test]
    fn test_empty_corpus_yields_preamble_only() {
        let prefix = builder().build_at(&[], Instant::now());
        assert_eq!(prefix.content, INSTRUCTION_PREAMBLE);
        assert_eq!(prefix.knowledge_tokens, 0);
        assert!(!prefix.cache_eligible);
        assert!(prefix.token_count > 0);
    }

    #[test]
    fn test_get_or_build_returns_same_prefix_before_expiry() {
        let builder = builder();
        let docs = vec![doc("a", 100)];
        let mut slot = None;
        let t0 = Instant::now();

        let first = builder.get_or_build_at(&mut slot, &docs, t0);
        let at_59 = builder.get_or_build_at(&mut slot, &docs, t0 + Duration::from_secs(59 * 60));

        assert!(Arc::ptr_eq(&first, &at_59));
        assert_eq!(first.created_at, at_59.created_at);
    }

    #[test]
    fn test_get_or_build_rebuilds_after_expiry() {
        let builder = builder();
        let docs = vec![doc("a", 100)];
        let mut slot = None;
        let t0 = Instant::now();

        let first = builder.get_or_build_at(&mut slot, &docs, t0);
        let at_61 = builder.get_or_build_at(&mut slot, &docs, t0 + Duration::from_secs(61 * 60));

        assert!(!Arc::ptr_eq(&first, &at_61));
        // Unchanged corpus reproduces identical bytes.
        assert_eq!(first.content_hash, at_61.content_hash);
        assert!(at_61.created_at > first.created_at);
    }

    #[test]
    fn test_get_or_build_builds_when_never_built() {
        let mut slot = None;
        let prefix = builder().get_or_build_at(&mut slot, &[doc("a", 40)], Instant::now());
        assert!(slot.is_some());
        assert_eq!(slot.as_ref().unwrap().content_hash, prefix.content_hash);
    }

    #[test]
    fn test_expiry_boundary_is_inclusive() {
        let builder = ContextCacheBuilder::new(Duration::from_secs(60));
        let now = Instant::now();
        let prefix = builder.build_at(&[], now);

        assert!(!prefix.is_expired_at(now + Duration::from_secs(59)));
        assert!(prefix.is_expired_at(now + Duration::from_secs(60)));
    }
}
