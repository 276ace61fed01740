use super::{
    CatalogApi, CatalogError, CatalogPage, ItemUpdate, MediaInput, MetafieldInput, MutationOutcome,
    config::graphql_endpoint,
};
use crate::{
    http::build_client,
    models::{CatalogItem, ItemImage, ItemStatus, Metafield, Seo, Variant},
};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::{Value, json};
use tracing::debug;

const PRODUCT_FIELDS: &str = r#"
  id
  title
  descriptionHtml
  productType
  vendor
  tags
  status
  category { fullName }
  seo { title description }
  variants(first: 10) { edges { node { id sku barcode } } }
  images(first: 10) { edges { node { url altText width height } } }
  metafields(first: 30) { edges { node { namespace key value } } }
"#;

const UPDATE_PRODUCT_MUTATION: &str = r#"
mutation UpdateProduct($input: ProductInput!) {
  productUpdate(input: $input) {
    product { id }
    userErrors { field message }
  }
}"#;

const SET_METAFIELDS_MUTATION: &str = r#"
mutation MetafieldsSet($metafields: [MetafieldsSetInput!]!) {
  metafieldsSet(metafields: $metafields) {
    metafields { id }
    userErrors { field message }
  }
}"#;

const CREATE_MEDIA_MUTATION: &str = r#"
mutation ProductCreateMedia($productId: ID!, $media: [CreateMediaInput!]!) {
  productCreateMedia(productId: $productId, media: $media) {
    media { alt }
    mediaUserErrors { field message }
  }
}"#;

/// Keys that must never reach a product mutation.
const PRICING_KEYS: &[&str] = &["variants", "price", "compareAtPrice", "cost"];

pub fn strip_pricing_fields(input: &mut Value) {
    if let Some(obj) = input.as_object_mut() {
        for key in PRICING_KEYS {
            obj.remove(*key);
        }
    }
}

/// Shopify Admin GraphQL client for one shop.
pub struct ShopifyClient {
    http: Client,
    endpoint: String,
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct GraphQlEnvelope<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct Connection<T> {
    #[serde(default = "Vec::new")]
    edges: Vec<Edge<T>>,
}

impl<T> Default for Connection<T> {
    fn default() -> Self {
        Self { edges: Vec::new() }
    }
}

#[derive(Debug, Deserialize)]
struct Edge<T> {
    node: T,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    has_next_page: bool,
    end_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawProduct {
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    description_html: Option<String>,
    #[serde(default)]
    product_type: Option<String>,
    #[serde(default)]
    vendor: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    status: Option<ItemStatus>,
    #[serde(default)]
    category: Option<RawCategory>,
    #[serde(default)]
    seo: Option<RawSeo>,
    #[serde(default)]
    variants: Connection<RawVariant>,
    #[serde(default)]
    images: Connection<RawImage>,
    #[serde(default)]
    metafields: Connection<Metafield>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCategory {
    full_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawSeo {
    title: Option<String>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawVariant {
    id: String,
    sku: Option<String>,
    barcode: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawImage {
    url: String,
    alt_text: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
}

impl From<RawProduct> for CatalogItem {
    fn from(raw: RawProduct) -> Self {
        CatalogItem {
            id: raw.id,
            title: raw.title,
            description_html: raw.description_html.unwrap_or_default(),
            product_type: raw.product_type.unwrap_or_default(),
            category: raw.category.and_then(|c| c.full_name),
            vendor: raw.vendor.unwrap_or_default(),
            tags: raw.tags,
            status: raw.status.unwrap_or_default(),
            variants: raw
                .variants
                .edges
                .into_iter()
                .map(|e| Variant {
                    id: e.node.id,
                    sku: e.node.sku,
                    barcode: e.node.barcode,
                })
                .collect(),
            images: raw
                .images
                .edges
                .into_iter()
                .map(|e| ItemImage {
                    url: e.node.url,
                    alt_text: e.node.alt_text,
                    width: e.node.width,
                    height: e.node.height,
                })
                .collect(),
            seo: raw
                .seo
                .map(|s| Seo {
                    title: s.title,
                    description: s.description,
                })
                .unwrap_or_default(),
            metafields: raw.metafields.edges.into_iter().map(|e| e.node).collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct UserError {
    #[serde(default)]
    field: Option<Vec<String>>,
    message: String,
}

fn outcome(errors: Vec<UserError>) -> MutationOutcome {
    MutationOutcome {
        user_errors: errors
            .into_iter()
            .map(|e| match e.field {
                Some(path) if !path.is_empty() => format!("{}: {}", path.join("."), e.message),
                _ => e.message,
            })
            .collect(),
    }
}

impl ShopifyClient {
    pub fn new(shop: &str, access_token: &str) -> Self {
        Self {
            http: build_client(),
            endpoint: graphql_endpoint(shop),
            access_token: access_token.to_string(),
        }
    }

    async fn graphql<T: DeserializeOwned>(&self, query: &str, variables: Value) -> Result<T, CatalogError> {
        let response = self
            .http
            .post(&self.endpoint)
            .header("X-Shopify-Access-Token", &self.access_token)
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await
            .map_err(|err| CatalogError::Transport(err.to_string()))?;

        if !response.status().is_success() {
            return Err(CatalogError::Http(response.status().as_u16()));
        }

        let envelope: GraphQlEnvelope<T> = response
            .json()
            .await
            .map_err(|err| CatalogError::Decode(err.to_string()))?;
        match envelope.data {
            Some(data) => Ok(data),
            None => Err(CatalogError::GraphQl(
                envelope
                    .errors
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "no data returned".into()),
            )),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProductsData {
    products: ProductsConnection,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProductsConnection {
    edges: Vec<Edge<RawProduct>>,
    page_info: PageInfo,
}

#[derive(Debug, Deserialize)]
struct ProductData {
    product: Option<RawProduct>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProductUpdateData {
    product_update: Option<UserErrorsPayload>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetafieldsSetData {
    metafields_set: Option<UserErrorsPayload>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserErrorsPayload {
    #[serde(default)]
    user_errors: Vec<UserError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateMediaData {
    product_create_media: Option<MediaErrorsPayload>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MediaErrorsPayload {
    #[serde(default)]
    media_user_errors: Vec<UserError>,
}

#[async_trait]
impl CatalogApi for ShopifyClient {
    async fn list_active(&self, cursor: Option<&str>, page_size: u32) -> Result<CatalogPage, CatalogError> {
        let query = format!(
            "query ActiveProducts($first: Int!, $cursor: String, $query: String) {{
  products(first: $first, after: $cursor, query: $query, sortKey: CREATED_AT, reverse: true) {{
    edges {{ node {{ {PRODUCT_FIELDS} }} }}
    pageInfo {{ hasNextPage endCursor }}
  }}
}}"
        );
        let data: ProductsData = self
            .graphql(
                &query,
                json!({ "first": page_size, "cursor": cursor, "query": "status:active" }),
            )
            .await?;
        let next_cursor = if data.products.page_info.has_next_page {
            data.products.page_info.end_cursor
        } else {
            None
        };
        debug!(
            target = "smartenrich.catalog",
            count = data.products.edges.len(),
            has_next = next_cursor.is_some(),
            "catalog_page_fetched"
        );
        Ok(CatalogPage {
            items: data.products.edges.into_iter().map(|e| e.node.into()).collect(),
            next_cursor,
        })
    }

    async fn fetch_item(&self, id: &str) -> Result<Option<CatalogItem>, CatalogError> {
        let query = format!("query Product($id: ID!) {{ product(id: $id) {{ {PRODUCT_FIELDS} }} }}");
        let data: ProductData = self.graphql(&query, json!({ "id": id })).await?;
        Ok(data.product.map(CatalogItem::from))
    }

    async fn update_item(&self, update: &ItemUpdate) -> Result<MutationOutcome, CatalogError> {
        let mut input = serde_json::to_value(update).map_err(|err| CatalogError::Decode(err.to_string()))?;
        strip_pricing_fields(&mut input);
        let data: ProductUpdateData = self
            .graphql(UPDATE_PRODUCT_MUTATION, json!({ "input": input }))
            .await?;
        Ok(outcome(data.product_update.map(|p| p.user_errors).unwrap_or_default()))
    }

    async fn set_metafields(&self, inputs: &[MetafieldInput]) -> Result<MutationOutcome, CatalogError> {
        let data: MetafieldsSetData = self
            .graphql(SET_METAFIELDS_MUTATION, json!({ "metafields": inputs }))
            .await?;
        Ok(outcome(data.metafields_set.map(|p| p.user_errors).unwrap_or_default()))
    }

    async fn create_media(&self, item_id: &str, media: &[MediaInput]) -> Result<MutationOutcome, CatalogError> {
        let data: CreateMediaData = self
            .graphql(
                CREATE_MEDIA_MUTATION,
                json!({ "productId": item_id, "media": media }),
            )
            .await?;
        Ok(outcome(
            data.product_create_media
                .map(|p| p.media_user_errors)
                .unwrap_or_default(),
        ))
    }
}
