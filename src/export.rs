use std::ffi::OsString;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use pulldown_cmark::{Options, Parser};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::app::artifact_store::{ArtifactStore, StoredArtifact};
use crate::collaborators::run_with_timeout;
use crate::generator::{MaterialKind, prompts};
use crate::library::{Library, Material};
use crate::llm::{ChatRequest, LlmClient, Stage};
use crate::markdown::{self, Node, NodeKind};
use crate::progress::Progress;

const ABSTRACT_MAX_OUTPUT_TOKENS: u32 = 400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Md,
    Pdf,
    Docx,
    Zip,
}

impl ExportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Md => "md",
            Self::Pdf => "pdf",
            Self::Docx => "docx",
            Self::Zip => "zip",
        }
    }
}

/// Front matter written at the top of exported markdown.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetadataHeader {
    pub title: String,
    pub lecture: String,
    pub course: String,
    pub kind: MaterialKind,
    pub lang: String,
    pub date: String,
    #[serde(rename = "abstract", skip_serializing_if = "Option::is_none")]
    pub abstract_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub online_copy: Option<String>,
}

#[async_trait]
pub trait MarkdownConverter: Send + Sync {
    fn markdown_to_html(&self, markdown: &str) -> String;
    async fn html_to_pdf(&self, html: &str, out: &Path) -> anyhow::Result<()>;
    async fn html_to_docx(&self, html: &str, out: &Path) -> anyhow::Result<()>;
    async fn save_markdown(&self, markdown: &str, out: &Path) -> anyhow::Result<()>;
    fn generate_metadata_header(&self, header: &MetadataHeader) -> anyhow::Result<String>;
}

/// HTML through `pulldown-cmark`; PDF and DOCX through pandoc.
#[derive(Debug, Clone)]
pub struct PandocConverter {
    pandoc: OsString,
    pdf_engine: Option<String>,
    timeout: Duration,
}

impl PandocConverter {
    pub fn new(pandoc: impl Into<OsString>, timeout: Duration) -> Self {
        Self {
            pandoc: pandoc.into(),
            pdf_engine: None,
            timeout,
        }
    }

    pub fn with_pdf_engine(mut self, engine: impl Into<String>) -> Self {
        self.pdf_engine = Some(engine.into());
        self
    }

    async fn run_pandoc(&self, html: &str, out: &Path, to: &str, engine: Option<&str>) -> anyhow::Result<()> {
        let input = out.with_extension("html");
        tokio::fs::write(&input, html)
            .await
            .with_context(|| format!("write html: {}", input.display()))?;
        let dir = out
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));

        tracing::info!(format = to, pdf_engine = ?engine, out = %out.display(), "render via pandoc");
        let args = build_pandoc_args(&input, out, dir, to, engine);
        run_with_timeout(&self.pandoc, args, dir, self.timeout)
            .await
            .with_context(|| format!("render {to}"))?;
        Ok(())
    }
}

fn build_pandoc_args(
    input: &Path,
    out: &Path,
    resource_dir: &Path,
    to: &str,
    pdf_engine: Option<&str>,
) -> Vec<OsString> {
    let mut args = vec![
        input.as_os_str().to_owned(),
        OsString::from("-o"),
        out.as_os_str().to_owned(),
        OsString::from("--from"),
        OsString::from("html"),
        OsString::from("--to"),
        OsString::from(to),
        OsString::from("--resource-path"),
        resource_dir.as_os_str().to_owned(),
    ];
    if let Some(engine) = pdf_engine {
        args.push(OsString::from("--pdf-engine"));
        args.push(OsString::from(engine));
    }
    args
}

#[async_trait]
impl MarkdownConverter for PandocConverter {
    fn markdown_to_html(&self, markdown: &str) -> String {
        let mut options = Options::empty();
        options.insert(Options::ENABLE_FOOTNOTES);
        options.insert(Options::ENABLE_STRIKETHROUGH);
        options.insert(Options::ENABLE_TABLES);
        options.insert(Options::ENABLE_YAML_STYLE_METADATA_BLOCKS);

        let parser = Parser::new_ext(markdown, options);
        let mut html = String::new();
        pulldown_cmark::html::push_html(&mut html, parser);
        html
    }

    async fn html_to_pdf(&self, html: &str, out: &Path) -> anyhow::Result<()> {
        let engines = match self.pdf_engine.as_deref() {
            Some(engine) => vec![engine],
            None => vec!["weasyprint", "tectonic"],
        };
        let mut last_failure = None;
        for engine in engines {
            match self.run_pandoc(html, out, "pdf", Some(engine)).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    tracing::warn!(pdf_engine = engine, error = %format!("{err:#}"), "pdf engine failed");
                    last_failure = Some(err);
                }
            }
        }
        Err(last_failure.unwrap_or_else(|| anyhow::anyhow!("no pdf engine candidates")))
    }

    async fn html_to_docx(&self, html: &str, out: &Path) -> anyhow::Result<()> {
        self.run_pandoc(html, out, "docx", None).await
    }

    async fn save_markdown(&self, markdown: &str, out: &Path) -> anyhow::Result<()> {
        tokio::fs::write(out, markdown)
            .await
            .with_context(|| format!("write markdown: {}", out.display()))
    }

    fn generate_metadata_header(&self, header: &MetadataHeader) -> anyhow::Result<String> {
        let yaml = serde_yaml::to_string(header).context("serialize metadata header")?;
        Ok(format!("---\n{yaml}---\n\n"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportRequest {
    pub material_id: String,
    pub format: ExportFormat,
    /// Render twice, the second time embedding a QR code linking to the first output.
    #[serde(default)]
    pub qr_code: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportOutcome {
    pub artifact: StoredArtifact,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub online_copy: Option<StoredArtifact>,
    pub cited_images: usize,
    pub has_abstract: bool,
}

/// Turns a stored material back into a citation-enriched document and publishes it.
#[derive(Clone)]
pub struct ExportAssembler {
    library: Library,
    llm: Option<LlmClient>,
    model: String,
    converter: Arc<dyn MarkdownConverter>,
    artifacts: Arc<dyn ArtifactStore>,
}

impl ExportAssembler {
    pub fn new(
        library: Library,
        converter: Arc<dyn MarkdownConverter>,
        artifacts: Arc<dyn ArtifactStore>,
    ) -> Self {
        Self {
            library,
            llm: None,
            model: crate::generator::DEFAULT_MODEL.to_owned(),
            converter,
            artifacts,
        }
    }

    /// Enables the abstract pass.
    pub fn with_llm(mut self, llm: LlmClient, model: impl Into<String>) -> Self {
        self.llm = Some(llm);
        self.model = model.into();
        self
    }

    pub async fn export(
        &self,
        request: &ExportRequest,
        work_dir: &Path,
        progress: &dyn Progress,
    ) -> anyhow::Result<ExportOutcome> {
        progress.report(5, "loading material").await;
        let material = self
            .library
            .get_material(&request.material_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("material not found: {}", request.material_id))?;
        let lecture = self.library.require_lecture(&material.lecture_id).await?;

        let mut tree = markdown::parse(&material.content);
        let sources = self.library.get_material_sources(&material.id).await?;
        markdown::bind_citations(&mut tree, &sources);
        let images = self.library.course_page_images(&lecture.course_id).await?;
        let cited_images = markdown::enrich_with_cited_images(&mut tree, |file, page| {
            images.get(&(file.to_owned(), page)).cloned()
        });
        tracing::info!(
            material_id = %material.id,
            sources = sources.len(),
            cited_images,
            "citations bound"
        );

        progress.report(25, "writing abstract").await;
        let abstract_text = self.write_abstract(&material).await?;

        let mut header = MetadataHeader {
            title: material.title.clone(),
            lecture: lecture.title.clone(),
            course: lecture.course_id.clone(),
            kind: material.kind,
            lang: lecture.language.clone(),
            date: material.created_at.format("%Y-%m-%d").to_string(),
            abstract_text,
            online_copy: None,
        };
        let file_name = format!("{}.{}", slugify(&material.title), request.format.extension());

        progress.report(50, "rendering").await;
        let first_dir = work_dir.join("render");
        let first = self
            .render(&tree, &header, request.format, &first_dir, &file_name)
            .await?;
        let first = self
            .artifacts
            .put_file(&first, &file_name)
            .await
            .context("upload rendered material")?;

        if !request.qr_code {
            progress.report(95, "published").await;
            return Ok(ExportOutcome {
                artifact: first,
                online_copy: None,
                cited_images,
                has_abstract: header.abstract_text.is_some(),
            });
        }

        progress.report(75, "embedding qr code").await;
        let second_dir = work_dir.join("render-qr");
        tokio::fs::create_dir_all(&second_dir)
            .await
            .with_context(|| format!("create render dir: {}", second_dir.display()))?;
        let qr_path = second_dir.join("online-copy.svg");
        tokio::fs::write(&qr_path, qr_svg(&first.uri)?)
            .await
            .with_context(|| format!("write qr code: {}", qr_path.display()))?;
        header.online_copy = Some(first.uri.clone());
        tree.children.push(online_copy_section(&qr_path, &first.uri));

        let second = self
            .render(&tree, &header, request.format, &second_dir, &file_name)
            .await?;
        let second = self
            .artifacts
            .put_file(&second, &file_name)
            .await
            .context("upload rendered material with qr code")?;
        progress.report(95, "published").await;
        Ok(ExportOutcome {
            artifact: second,
            online_copy: Some(first),
            cited_images,
            has_abstract: header.abstract_text.is_some(),
        })
    }

    async fn write_abstract(&self, material: &Material) -> anyhow::Result<Option<String>> {
        let Some(llm) = &self.llm else {
            return Ok(None);
        };
        let request = ChatRequest::new(
            self.model.clone(),
            prompts::abstract_(&material.title, &material.content),
        )
        .with_max_output_tokens(ABSTRACT_MAX_OUTPUT_TOKENS);
        match llm.complete(Stage::Abstract, request).await {
            Ok(response) => {
                let text = response.text.trim();
                Ok((!text.is_empty()).then(|| text.to_owned()))
            }
            Err(err) if err.is_cost_exceeded() => Err(err.into()),
            Err(err) => {
                tracing::warn!(error = %format!("{:#}", anyhow::Error::from(err)), "abstract generation failed; exporting without one");
                Ok(None)
            }
        }
    }

    async fn render(
        &self,
        tree: &Node,
        header: &MetadataHeader,
        format: ExportFormat,
        out_dir: &Path,
        file_name: &str,
    ) -> anyhow::Result<PathBuf> {
        tokio::fs::create_dir_all(out_dir)
            .await
            .with_context(|| format!("create render dir: {}", out_dir.display()))?;
        let out = out_dir.join(file_name);

        match format {
            ExportFormat::Md => {
                let text = self.converter.generate_metadata_header(header)? + &markdown::reconstruct(tree);
                self.converter.save_markdown(&text, &out).await?;
            }
            ExportFormat::Pdf | ExportFormat::Docx => {
                let body = self.converter.markdown_to_html(&markdown::reconstruct(tree));
                let html = wrap_html_document(header, &body);
                if format == ExportFormat::Pdf {
                    self.converter.html_to_pdf(&html, &out).await?;
                } else {
                    self.converter.html_to_docx(&html, &out).await?;
                }
            }
            ExportFormat::Zip => {
                let bundle_dir = out_dir.join("bundle");
                let images_dir = bundle_dir.join("images");
                let mut tree = tree.clone();
                let (tree, images) = tokio::task::spawn_blocking(move || {
                    bundle_images(&mut tree, &images_dir).map(|images| (tree, images))
                })
                .await
                .context("join image bundling task")??;
                let md_name = Path::new(file_name).with_extension("md");
                let text = self.converter.generate_metadata_header(header)? + &markdown::reconstruct(&tree);
                self.converter
                    .save_markdown(&text, &bundle_dir.join(&md_name))
                    .await?;
                tracing::debug!(images, "bundling markdown with cited images");

                let out_for_blocking = out.clone();
                tokio::task::spawn_blocking(move || {
                    create_zip_blocking(&bundle_dir, &md_name, &out_for_blocking)
                })
                .await
                .context("join zip task")??;
            }
        }
        Ok(out)
    }
}

fn online_copy_section(qr_path: &Path, uri: &str) -> Node {
    Node::section(2, "Online copy")
        .with_child(Node::paragraph(format!("![QR code]({})", qr_path.display())))
        .with_child(Node::paragraph(format!("<{uri}>")))
}

fn qr_svg(uri: &str) -> anyhow::Result<String> {
    let code = qrcode::QrCode::new(uri.as_bytes()).context("encode qr code")?;
    Ok(code
        .render::<qrcode::render::svg::Color<'_>>()
        .min_dimensions(200, 200)
        .build())
}

static STANDALONE_IMAGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^!\[([^\]]*)\]\(([^)\s]+)\)$").expect("standalone image regex")
});

/// Copies footnote images and standalone image paragraphs into `images_dir`,
/// pointing the tree at the copies. Sources that are not local files (remote URLs,
/// missing paths) keep their original link.
fn bundle_images(tree: &mut Node, images_dir: &Path) -> anyhow::Result<usize> {
    let mut copies: Vec<(PathBuf, PathBuf)> = Vec::new();
    let mut relocate = |source: &Path| -> Option<PathBuf> {
        if !source.is_file() {
            tracing::warn!(source = %source.display(), "image is not a local file; link kept");
            return None;
        }
        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "image".to_owned());
        let relative = PathBuf::from("images").join(format!("{:02}-{name}", copies.len() + 1));
        copies.push((source.to_path_buf(), relative.clone()));
        Some(relative)
    };
    tree.walk_mut(&mut |node| match node.kind {
        NodeKind::Footnote => {
            if let Some(relative) = node.image_path.as_deref().and_then(&mut relocate) {
                node.image_path = Some(relative);
            }
        }
        NodeKind::Paragraph => {
            let Some(caps) = STANDALONE_IMAGE_RE.captures(node.content.trim()) else {
                return;
            };
            if let Some(relative) = relocate(Path::new(&caps[2])) {
                node.content = format!("![{}]({})", &caps[1], relative.display());
            }
        }
        _ => {}
    });

    std::fs::create_dir_all(images_dir)
        .with_context(|| format!("create images dir: {}", images_dir.display()))?;
    let root = images_dir.parent().unwrap_or(images_dir);
    for (source, relative) in &copies {
        std::fs::copy(source, root.join(relative))
            .with_context(|| format!("copy image: {}", source.display()))?;
    }
    Ok(copies.len())
}

fn create_zip_blocking(bundle_dir: &Path, md_name: &Path, out_zip: &Path) -> anyhow::Result<()> {
    let file =
        File::create(out_zip).with_context(|| format!("create zip: {}", out_zip.display()))?;
    let mut zip = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .unix_permissions(0o644);

    let md_path = bundle_dir.join(md_name);
    zip.start_file(md_name.to_string_lossy(), options)
        .with_context(|| format!("zip start_file {}", md_name.display()))?;
    let mut md = File::open(&md_path).with_context(|| format!("open: {}", md_path.display()))?;
    io::copy(&mut md, &mut zip).context("zip write markdown")?;

    let images_dir = bundle_dir.join("images");
    let mut entries = std::fs::read_dir(&images_dir)
        .with_context(|| format!("read dir: {}", images_dir.display()))?
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("list dir: {}", images_dir.display()))?;
    entries.sort_by_key(|e| e.file_name());
    if !entries.is_empty() {
        zip.add_directory("images", options)
            .context("zip add_directory images")?;
    }
    for entry in entries {
        let zip_path = format!("images/{}", entry.file_name().to_string_lossy());
        zip.start_file(zip_path.as_str(), options)
            .with_context(|| format!("zip start_file: {zip_path}"))?;
        let mut image =
            File::open(entry.path()).with_context(|| format!("open: {}", entry.path().display()))?;
        io::copy(&mut image, &mut zip).with_context(|| format!("zip write: {zip_path}"))?;
    }

    zip.finish().context("zip finish")?;
    Ok(())
}

fn wrap_html_document(header: &MetadataHeader, body_html: &str) -> String {
    let mut out = String::new();
    out.push_str("<!DOCTYPE html>\n");
    out.push_str(&format!("<html lang=\"{}\">\n", html_escape(&header.lang)));
    out.push_str("<head>\n");
    out.push_str("  <meta charset=\"utf-8\" />\n");
    out.push_str(&format!("  <title>{}</title>\n", html_escape(&header.title)));
    out.push_str("</head>\n");
    out.push_str("<body>\n");
    if let Some(text) = &header.abstract_text {
        out.push_str(&format!(
            "<section class=\"abstract\"><p><em>{}</em></p></section>\n",
            html_escape(text)
        ));
    }
    out.push_str(body_html);
    if !body_html.ends_with('\n') {
        out.push('\n');
    }
    out.push_str("</body>\n");
    out.push_str("</html>\n");
    out
}

fn html_escape(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

fn slugify(title: &str) -> String {
    let slug = title
        .chars()
        .map(|c| {
            if c.is_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect::<String>()
        .split('-')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.is_empty() {
        "material".to_owned()
    } else {
        slug
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read as _;

    use serde_json::json;

    use super::*;
    use crate::app::artifact_store::LocalFsArtifactStore;
    use crate::collaborators::Page;
    use crate::db;
    use crate::markdown::ParsedCitation;
    use crate::progress::NoProgress;

    const CONTENT: &str = "# Cell Biology\n\n## Membranes\n\nWater crosses membranes.[^1]\n\n[^1]: Osmosis.\n";

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        library: Library,
        material_id: String,
    }

    async fn fixture() -> anyhow::Result<Fixture> {
        let dir = tempfile::tempdir()?;
        let root = dir.path().to_path_buf();
        let library = Library::new(db::in_memory().await?);
        let lecture = library.create_lecture("bio", "Cells", "English").await?;
        let document = library.create_document(&lecture.id, "bio.pdf", "Biology").await?;
        let image = root.join("page-4.png");
        std::fs::write(&image, b"png")?;
        library
            .replace_document_pages(
                &document.id,
                &[Page {
                    number: 4,
                    image_path: Some(image),
                    text: "Osmosis".to_owned(),
                }],
            )
            .await?;
        let material = library
            .save_material(
                &lecture.id,
                MaterialKind::Guide,
                "Cell Biology",
                CONTENT,
                &[ParsedCitation {
                    number: 1,
                    description: "Osmosis.".to_owned(),
                    file: Some("bio.pdf".to_owned()),
                    pages: vec![4],
                }],
                &json!({}),
            )
            .await?;
        Ok(Fixture {
            _dir: dir,
            root,
            library,
            material_id: material.id,
        })
    }

    fn assembler(fixture: &Fixture) -> ExportAssembler {
        ExportAssembler::new(
            fixture.library.clone(),
            Arc::new(PandocConverter::new("pandoc", Duration::from_secs(30))),
            Arc::new(LocalFsArtifactStore::new(fixture.root.join("data"))),
        )
    }

    #[tokio::test]
    async fn markdown_export_carries_front_matter_and_cited_image() -> anyhow::Result<()> {
        let fixture = fixture().await?;
        let outcome = assembler(&fixture)
            .export(
                &ExportRequest {
                    material_id: fixture.material_id.clone(),
                    format: ExportFormat::Md,
                    qr_code: false,
                },
                &fixture.root.join("work"),
                &NoProgress,
            )
            .await?;

        assert_eq!(outcome.cited_images, 1);
        assert!(outcome.online_copy.is_none());
        assert_eq!(outcome.artifact.name, "cell-biology.md");
        let text = std::fs::read_to_string(&outcome.artifact.path)?;
        assert!(text.starts_with("---\ntitle: Cell Biology\n"));
        assert!(text.contains("kind: guide"));
        assert!(text.contains("![Source page]("));
        assert!(text.contains("page-4.png"));
        Ok(())
    }

    #[tokio::test]
    async fn zip_export_bundles_images_and_qr_pass_links_first_output() -> anyhow::Result<()> {
        let fixture = fixture().await?;
        let outcome = assembler(&fixture)
            .export(
                &ExportRequest {
                    material_id: fixture.material_id.clone(),
                    format: ExportFormat::Zip,
                    qr_code: true,
                },
                &fixture.root.join("work"),
                &NoProgress,
            )
            .await?;

        let first = outcome.online_copy.expect("first pass artifact");
        assert_ne!(first.digest, outcome.artifact.digest);

        let mut archive = zip::ZipArchive::new(File::open(&outcome.artifact.path)?)?;
        let mut markdown = String::new();
        archive
            .by_name("cell-biology.md")?
            .read_to_string(&mut markdown)?;
        assert!(markdown.contains("![Source page](images/01-page-4.png)"));
        assert!(markdown.contains(&first.uri));
        assert!(markdown.contains("## Online copy"));
        assert!(archive.by_name("images/01-page-4.png").is_ok());
        assert!(archive.by_name("images/02-online-copy.svg").is_ok());
        Ok(())
    }

    #[test]
    fn bundling_keeps_remote_and_missing_image_links() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let local = dir.path().join("fig.png");
        std::fs::write(&local, b"png")?;
        let mut tree = Node::document(vec![
            Node::section(2, "Figures")
                .with_child(Node::paragraph("![remote](https://example.com/x.png)"))
                .with_child(Node::paragraph(format!(
                    "![missing]({})",
                    dir.path().join("gone.png").display()
                )))
                .with_child(Node::paragraph(format!("![local]({})", local.display()))),
        ]);
        let images_dir = dir.path().join("bundle").join("images");

        assert_eq!(bundle_images(&mut tree, &images_dir)?, 1);
        let text = markdown::reconstruct(&tree);
        assert!(text.contains("![remote](https://example.com/x.png)"));
        assert!(text.contains("gone.png)"));
        assert!(text.contains("![local](images/01-fig.png)"));
        assert!(images_dir.join("01-fig.png").is_file());
        Ok(())
    }

    #[test]
    fn slugs_are_filesystem_safe() {
        assert_eq!(slugify("Cell Biology: Part 2!"), "cell-biology-part-2");
        assert_eq!(slugify("???"), "material");
    }

    #[test]
    fn html_document_escapes_title_and_abstract() {
        let header = MetadataHeader {
            title: "A <b> & C".to_owned(),
            lecture: "L".to_owned(),
            course: "c".to_owned(),
            kind: MaterialKind::Quiz,
            lang: "en".to_owned(),
            date: "2026-01-01".to_owned(),
            abstract_text: Some("Short \"summary\".".to_owned()),
            online_copy: None,
        };
        let html = wrap_html_document(&header, "<p>body</p>");
        assert!(html.contains("<title>A &lt;b&gt; &amp; C</title>"));
        assert!(html.contains("Short &quot;summary&quot;."));
        assert!(html.ends_with("<p>body</p>\n</body>\n</html>\n"));
    }
}
