use super::{IdAllocator, NodeSnapshot};
use crate::core::error::PipelineError;
use scraper::{ElementRef, Html, Selector};

/// 扫描页面快照里已经存在的图片和视频，生成初始的 `Added` 节点
pub fn scan_document(html: &str, ids: &IdAllocator) -> Result<Vec<NodeSnapshot>, PipelineError> {
    let document = Html::parse_document(html);
    let media_selector = selector("img, video")?;
    let source_selector = selector("source[src]")?;

    let nodes = document
        .select(&media_selector)
        .map(|element| {
            let tag = element.value().name();
            let mut node = NodeSnapshot::new(ids.next_id(), tag);

            let source = element.value().attr("src").or_else(|| {
                if tag == "video" {
                    element
                        .select(&source_selector)
                        .next()
                        .and_then(|s| s.value().attr("src"))
                } else {
                    None
                }
            });
            if let Some(source) = source {
                node = node.with_source(source);
            }

            let (width, height) = (dimension(&element, "width"), dimension(&element, "height"));
            node.with_dimensions(width, height)
        })
        .collect();

    Ok(nodes)
}

fn selector(css: &str) -> Result<Selector, PipelineError> {
    Selector::parse(css).map_err(|e| PipelineError::Config(format!("bad selector {}: {:?}", css, e)))
}

/// 缺失或不是数字时返回 0（尺寸未知）
fn dimension(element: &ElementRef, attr: &str) -> u32 {
    element
        .value()
        .attr(attr)
        .and_then(|v| v.trim().trim_end_matches("px").parse::<u32>().ok())
        .unwrap_or(0)
}
