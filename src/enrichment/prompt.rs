use super::search::{BarcodeData, SearchResult};
use crate::{config::METAFIELDS, models::CatalogItem};
use std::fmt::Write;

pub const SYSTEM_PROMPT: &str = "Eres un experto en SEO y e-commerce especializado en productos de tecnologia para el mercado de Costa Rica. Tu trabajo es enriquecer fichas de productos para la tienda smart.cr.

REGLAS ESTRICTAS:
1. NUNCA incluyas informacion de precios, costos, descuentos o valores monetarios
2. Escribe todo en espanol de Costa Rica
3. Las descripciones deben ser HTML valido con parrafos, listas, y negritas
4. Solo incluye metafields que puedas confirmar con los datos proporcionados
5. Si no tenes certeza sobre un dato especifico, dejalo como null
6. IMPORTANTE sobre confidence_score:
   - Si el titulo del producto identifica claramente la marca y modelo, asigna >= 0.7
   - Si ademas tenes datos de busqueda web, asigna >= 0.8
   - Solo asigna < 0.5 si el producto es completamente generico sin marca ni modelo identificable
   - Para productos de tecnologia con marca conocida, la confianza minima debe ser 0.6

FORMATO DE RESPUESTA:
Responde UNICAMENTE con un objeto JSON valido, sin markdown, sin comentarios.";

const MAX_SNIPPETS: usize = 5;

fn or_placeholder<'a>(value: &'a str, placeholder: &'a str) -> &'a str {
    let trimmed = value.trim();
    if trimmed.is_empty() { placeholder } else { trimmed }
}

fn write_barcode_section(out: &mut String, data: &BarcodeData) {
    let _ = writeln!(out, "\n## DATOS DEL CODIGO DE BARRAS ({}):", data.source);
    for (label, value) in [
        ("Nombre", &data.name),
        ("Marca", &data.brand),
        ("Categoria", &data.category),
        ("Descripcion", &data.description),
    ] {
        if !value.trim().is_empty() {
            let _ = writeln!(out, "- {label}: {}", value.trim());
        }
    }
    for (key, value) in &data.specs {
        let _ = writeln!(out, "- {key}: {value}");
    }
}

pub fn build_user_prompt(item: &CatalogItem, results: &[SearchResult], barcode: Option<&BarcodeData>) -> String {
    let mut out = String::with_capacity(4096);
    let _ = writeln!(
        out,
        "Necesito que enriquezcas la siguiente ficha de producto para la tienda smart.cr (tecnologia en Costa Rica).\n"
    );
    let _ = writeln!(out, "## DATOS ACTUALES DEL PRODUCTO:");
    let _ = writeln!(out, "- Titulo: {}", item.title.trim());
    let _ = writeln!(
        out,
        "- Descripcion actual: {}",
        or_placeholder(&item.description_html, "VACIA")
    );
    let _ = writeln!(out, "- Tipo: {}", or_placeholder(&item.product_type, "SIN TIPO"));
    let _ = writeln!(out, "- Vendor/Marca: {}", or_placeholder(&item.vendor, "SIN MARCA"));
    let tags = item.tags.join(", ");
    let _ = writeln!(out, "- Tags actuales: {}", or_placeholder(&tags, "NINGUNO"));
    let _ = writeln!(out, "- SKU: {}", item.first_sku().unwrap_or("SIN SKU"));
    let _ = writeln!(out, "- Imagenes actuales: {} imagenes", item.images.len());
    let _ = writeln!(
        out,
        "- Categoria: {}\n",
        item.category.as_deref().map(str::trim).filter(|c| !c.is_empty()).unwrap_or("SIN CATEGORIA")
    );

    let _ = writeln!(out, "## DATOS ENCONTRADOS POR BUSQUEDA WEB:");
    if results.is_empty() {
        let _ = writeln!(out, "No se encontro informacion adicional");
    } else {
        for r in results.iter().take(MAX_SNIPPETS) {
            let _ = writeln!(out, "- {}: {}", r.title.trim(), r.snippet.trim());
        }
    }
    if let Some(data) = barcode {
        write_barcode_section(&mut out, data);
    }

    let _ = writeln!(out, "\n## METAFIELDS ACTUALES:");
    let mut any = false;
    for m in item.custom_metafields() {
        any = true;
        let _ = writeln!(out, "  {}: {}", m.key, m.value);
    }
    if !any {
        let _ = writeln!(out, "NINGUNO");
    }

    let metafield_lines: Vec<String> = METAFIELDS
        .qualified_keys()
        .map(|k| format!("    \"{k}\": \"valor o null\""))
        .collect();
    let metafield_guide: Vec<String> = METAFIELDS
        .fields
        .iter()
        .filter(|f| !f.label.is_empty())
        .map(|f| format!("- {}.{}: {}", METAFIELDS.namespace, f.key, f.label))
        .collect();
    let _ = write!(
        out,
        r#"
## QUE NECESITO QUE GENERES:

Responde con este JSON exacto:
{{
  "confidence_score": 0.0-1.0,
  "description_html": "<p>Descripcion SEO en HTML...</p>",
  "product_type": "Tipo de producto",
  "category_suggestion": "Electronics > Computers > Laptops",
  "tags": ["tag1", "tag2", "..."],
  "seo_title": "Titulo SEO (max 70 chars)",
  "seo_description": "Meta description SEO (max 160 chars)",
  "metafields": {{
{metafields}
  }},
  "image_analysis": {{
    "current_quality": "buena|regular|mala",
    "needs_more_images": true|false,
    "suggested_alt_texts": ["alt text 1", "alt text 2"]
  }}
}}

NOTAS:
- Solo incluye metafields que puedas confirmar con datos reales
- Descripcion: 150-300 palabras, HTML con <p>, <ul>, <li>, <strong>
- 5-15 tags relevantes en espanol
- category_suggestion usa taxonomia standard de Shopify
- NUNCA incluyas precio, costo, o valores monetarios

SIGNIFICADO DE CADA METAFIELD:
{guide}
"#,
        metafields = metafield_lines.join(",\n"),
        guide = metafield_guide.join("\n")
    );
    out
}
