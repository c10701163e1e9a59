//! 本地知识索引
//!
//! 语料目录下的 .txt/.md 分块、向量化后做余弦检索。向量化用确定性的
//! 哈希词袋嵌入，离线可用。建好的索引按语料指纹落盘，重启直接加载；
//! 语料或版本变了指纹就变，旧工件自然失效。

use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::cache::{fingerprint, ArtifactCache};
use crate::core::AssistantError;
use crate::providers::traits::{Document, Embedder, KnowledgeIndex};

/// 索引格式版本；变更时旧工件作废重建
pub const INDEX_VERSION: u32 = 1;

/// 语料缺失时的内置备稿，兼作"关于助手"的自述材料
const BUILTIN_CORPUS: &[(&str, &str)] = &[
    (
        "assistant-overview.md",
        "Valet is a single-user personal assistant. It reads recent mail, sends mail on \
         request, keeps a task list with due dates and priorities, schedules meetings, runs \
         guarded database queries, searches the web, and answers questions from this local \
         knowledge base. A daily summary of recent mail and pending tasks is delivered every \
         morning; the delivery time can be changed by asking, for example, to reschedule the \
         summary to 7:00 AM.",
    ),
    (
        "usage-notes.md",
        "Requests are plain sentences. Examples: 'Add task: buy milk due tomorrow', 'Check \
         my email', 'Schedule a meeting with bob@example.com at 3 pm on 6th October', 'Search \
         for rust async runtimes', 'List my tasks'. When a date is not given, the assistant \
         assumes the nearest future occurrence and says so in the reply.",
    ),
    (
        "data-handling.md",
        "Mail, tasks, meetings and query history are stored locally in a SQLite file. \
         Outbound calls (the language model, web search, mail) are rate limited with sliding \
         windows and retried with exponential backoff when the failure is transient. SQL \
         requests pass a keyword guard and always run with positional parameters.",
    ),
];

/// 哈希词袋嵌入：词切分、哈希进固定维度、L2 归一化。确定性、零依赖。
pub struct HashEmbedder {
    dim: usize,
}

impl HashEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(1) }
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Embedder for HashEmbedder {
    fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dim];
        for token in text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.len() > 1)
        {
            // DefaultHasher::new 用固定密钥，跨进程稳定
            let mut hasher = DefaultHasher::new();
            hasher.write(token.as_bytes());
            let bucket = (hasher.finish() as usize) % self.dim;
            vector[bucket] += 1.0;
        }
        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in vector.iter_mut() {
                *x /= norm;
            }
        }
        vector
    }
}

/// 余弦相似度
fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// 文本分块（UTF-8 安全）：尽量在段落/句子边界断开，块间保留重叠
fn chunk_text(text: &str, chunk_chars: usize, overlap_chars: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let total = chars.len();
    let mut chunks = Vec::new();
    if total == 0 || chunk_chars == 0 {
        return chunks;
    }

    let mut start = 0;
    while start < total {
        let target_end = (start + chunk_chars).min(total);
        let mut end = target_end;

        if target_end < total {
            let slice: String = chars[start..target_end].iter().collect();
            for sep in ["\n\n", "\n", ". ", " "] {
                if let Some(pos) = slice.rfind(sep) {
                    let cut = slice[..pos].chars().count() + sep.chars().count();
                    if cut > 0 {
                        end = start + cut;
                        break;
                    }
                }
            }
        }
        if end <= start {
            end = (start + 1).min(total);
        }

        let piece: String = chars[start..end].iter().collect();
        let trimmed = piece.trim();
        if !trimmed.is_empty() {
            chunks.push(trimmed.to_string());
        }

        let overlap = overlap_chars.min(end - start);
        let next = end.saturating_sub(overlap);
        start = if next > start { next } else { end };
    }
    chunks
}

#[derive(Serialize, Deserialize)]
struct StoredIndex {
    version: u32,
    dim: usize,
    chunks: Vec<StoredChunk>,
}

#[derive(Serialize, Deserialize, Clone)]
struct StoredChunk {
    source: String,
    text: String,
    embedding: Vec<f32>,
}

/// 持久化的本地索引
pub struct LocalKnowledgeIndex {
    embedder: Arc<dyn Embedder>,
    chunks: Vec<StoredChunk>,
}

impl LocalKnowledgeIndex {
    /// 打开（或重建）索引。缓存命中且版本/维度匹配时直接加载；
    /// 工件损坏或过期都按未命中处理，重建后尽力落盘。
    pub fn open(
        corpus_dir: &Path,
        cache: &ArtifactCache,
        embedder: Arc<dyn Embedder>,
        chunk_chars: usize,
        overlap_chars: usize,
    ) -> Result<Self, AssistantError> {
        let corpus = load_corpus(corpus_dir);
        let dim = embedder.embed("dim probe").len();

        let mut parts: Vec<String> = corpus
            .iter()
            .map(|(name, text)| format!("{name}:{}", text.len()))
            .collect();
        parts.push(format!("v{INDEX_VERSION}/d{dim}"));
        let key = fingerprint(parts);

        if let Some(stored) = cache.load::<StoredIndex>(&key) {
            if stored.version == INDEX_VERSION && stored.dim == dim {
                tracing::info!(chunks = stored.chunks.len(), "knowledge index loaded from cache");
                return Ok(Self {
                    embedder,
                    chunks: stored.chunks,
                });
            }
            tracing::info!("knowledge index artifact is stale, rebuilding");
        }

        let mut chunks = Vec::new();
        for (name, text) in &corpus {
            for piece in chunk_text(text, chunk_chars, overlap_chars) {
                let embedding = embedder.embed(&piece);
                chunks.push(StoredChunk {
                    source: name.clone(),
                    text: piece,
                    embedding,
                });
            }
        }
        tracing::info!(
            documents = corpus.len(),
            chunks = chunks.len(),
            "knowledge index built"
        );

        let stored = StoredIndex {
            version: INDEX_VERSION,
            dim,
            chunks: chunks.clone(),
        };
        // 落盘失败不致命，索引在内存里照常可用
        if let Err(err) = cache.store(&key, &stored) {
            tracing::warn!(error = %err, "knowledge index not persisted");
        }

        Ok(Self { embedder, chunks })
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }
}

fn load_corpus(dir: &Path) -> Vec<(String, String)> {
    let mut docs = Vec::new();
    if let Ok(entries) = std::fs::read_dir(dir) {
        let mut paths: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| {
                matches!(
                    p.extension().and_then(|e| e.to_str()),
                    Some("txt") | Some("md")
                )
            })
            .collect();
        paths.sort();
        for path in paths {
            if let Ok(text) = std::fs::read_to_string(&path) {
                if !text.trim().is_empty() {
                    let name = path
                        .file_name()
                        .and_then(|n| n.to_str())
                        .unwrap_or("doc")
                        .to_string();
                    docs.push((name, text));
                }
            }
        }
    }
    if docs.is_empty() {
        tracing::info!(dir = %dir.display(), "knowledge corpus missing, using built-in notes");
        docs = BUILTIN_CORPUS
            .iter()
            .map(|(name, text)| (name.to_string(), text.to_string()))
            .collect();
    }
    docs
}

#[async_trait]
impl KnowledgeIndex for LocalKnowledgeIndex {
    async fn similarity_search(
        &self,
        text: &str,
        top_k: usize,
    ) -> Result<Vec<Document>, AssistantError> {
        let query = self.embedder.embed(text);
        let mut scored: Vec<(f32, &StoredChunk)> = self
            .chunks
            .iter()
            .map(|chunk| (cosine_similarity(&query, &chunk.embedding), chunk))
            .filter(|(score, _)| *score > 0.0)
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        Ok(scored
            .into_iter()
            .take(top_k)
            .map(|(_, chunk)| Document {
                source: chunk.source.clone(),
                text: chunk.text.clone(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn embedder() -> Arc<dyn Embedder> {
        Arc::new(HashEmbedder::default())
    }

    fn write_corpus(dir: &Path) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(
            dir.join("rust.md"),
            "Rust is a systems programming language focused on safety and speed. \
             The borrow checker enforces memory safety at compile time.",
        )
        .unwrap();
        std::fs::write(
            dir.join("cooking.txt"),
            "To make pasta, boil water with salt and cook the noodles until al dente.",
        )
        .unwrap();
    }

    #[test]
    fn test_hash_embedder_is_deterministic_and_normalized() {
        let e = HashEmbedder::default();
        let a = e.embed("the borrow checker enforces safety");
        let b = e.embed("the borrow checker enforces safety");
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);

        let c = e.embed("completely different words here");
        assert_ne!(a, c);
    }

    #[test]
    fn test_chunking_splits_long_text_on_boundaries() {
        let text = "First sentence here. Second sentence follows. Third one closes.\n\nNew paragraph with more words to push past the limit.";
        let chunks = chunk_text(text, 60, 10);
        assert!(chunks.len() >= 2);
        for chunk in &chunks {
            assert!(!chunk.is_empty());
            assert!(chunk.chars().count() <= 60);
        }
    }

    #[tokio::test]
    async fn test_search_ranks_matching_document_first() {
        let dir = tempfile::tempdir().unwrap();
        let corpus = dir.path().join("corpus");
        write_corpus(&corpus);
        let cache = ArtifactCache::new(dir.path().join("cache"));

        let index =
            LocalKnowledgeIndex::open(&corpus, &cache, embedder(), 800, 80).unwrap();
        let docs = index
            .similarity_search("borrow checker memory safety", 2)
            .await
            .unwrap();
        assert!(!docs.is_empty());
        assert_eq!(docs[0].source, "rust.md");
    }

    #[tokio::test]
    async fn test_index_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let corpus = dir.path().join("corpus");
        write_corpus(&corpus);
        let cache_dir = dir.path().join("cache");
        let cache = ArtifactCache::new(&cache_dir);

        let first =
            LocalKnowledgeIndex::open(&corpus, &cache, embedder(), 800, 80).unwrap();
        assert_eq!(std::fs::read_dir(&cache_dir).unwrap().count(), 1);

        // 第二次打开从工件加载，块数一致
        let second =
            LocalKnowledgeIndex::open(&corpus, &cache, embedder(), 800, 80).unwrap();
        assert_eq!(first.chunk_count(), second.chunk_count());
        assert_eq!(std::fs::read_dir(&cache_dir).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_artifact_triggers_rebuild() {
        let dir = tempfile::tempdir().unwrap();
        let corpus = dir.path().join("corpus");
        write_corpus(&corpus);
        let cache_dir = dir.path().join("cache");
        let cache = ArtifactCache::new(&cache_dir);

        LocalKnowledgeIndex::open(&corpus, &cache, embedder(), 800, 80).unwrap();
        for entry in std::fs::read_dir(&cache_dir).unwrap().flatten() {
            std::fs::write(entry.path(), b"{definitely not an index").unwrap();
        }

        let rebuilt =
            LocalKnowledgeIndex::open(&corpus, &cache, embedder(), 800, 80).unwrap();
        assert!(rebuilt.chunk_count() > 0);
        let docs = rebuilt.similarity_search("pasta", 1).await.unwrap();
        assert_eq!(docs[0].source, "cooking.txt");
    }

    #[tokio::test]
    async fn test_corpus_change_invalidates_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let corpus = dir.path().join("corpus");
        write_corpus(&corpus);
        let cache_dir = dir.path().join("cache");
        let cache = ArtifactCache::new(&cache_dir);

        LocalKnowledgeIndex::open(&corpus, &cache, embedder(), 800, 80).unwrap();
        std::fs::write(
            corpus.join("new-doc.md"),
            "Fresh document about gardening and tomatoes.",
        )
        .unwrap();

        let index =
            LocalKnowledgeIndex::open(&corpus, &cache, embedder(), 800, 80).unwrap();
        // 新指纹产生了第二个工件
        assert_eq!(std::fs::read_dir(&cache_dir).unwrap().count(), 2);
        let docs = index.similarity_search("gardening tomatoes", 1).await.unwrap();
        assert_eq!(docs[0].source, "new-doc.md");
    }

    #[tokio::test]
    async fn test_builtin_corpus_when_dir_missing() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ArtifactCache::new(dir.path().join("cache"));

        let index = LocalKnowledgeIndex::open(
            &dir.path().join("nope"),
            &cache,
            embedder(),
            800,
            80,
        )
        .unwrap();
        let docs = index
            .similarity_search("daily summary of mail and tasks", 2)
            .await
            .unwrap();
        assert!(!docs.is_empty());
    }
}
