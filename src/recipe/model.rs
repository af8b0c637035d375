use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Full recipe record as returned by `GET /api/recipes/{id}`.
///
/// Stored verbatim in the Object Cache: fields this crate does not model are
/// kept in `extra` and written back out unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipe {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub main_spirit: Option<String>,
    #[serde(default)]
    pub glassware: Option<String>,
    #[serde(default)]
    pub serving_style: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub garnish: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub source_url: Option<String>,
    #[serde(default)]
    pub source_type: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub visibility: Option<String>,
    #[serde(default)]
    pub my_rating: Option<u8>,
    /// Whether `GET /api/recipes/{id}/image` has something to serve.
    #[serde(default)]
    pub has_image: bool,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub ingredients: Vec<RecipeIngredient>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipeIngredient {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub amount: Option<f64>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub order: i32,
    pub ingredient: Ingredient,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ingredient {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub spirit_category: Option<String>,
    /// `description`, `common_brands` and anything newer the service adds.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Lightweight shape used by gallery views (`RecipeListResponse` on the service).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipeListItem {
    pub id: String,
    pub name: String,
    pub template: Option<String>,
    pub main_spirit: Option<String>,
    pub glassware: Option<String>,
    pub serving_style: Option<String>,
    pub has_image: bool,
    pub user_id: Option<String>,
    pub visibility: Option<String>,
    pub my_rating: Option<u8>,
    pub created_at: Option<String>,
}

impl Recipe {
    /// Project a full recipe onto the gallery list shape. Pure; touches no storage.
    pub fn to_list_item(&self) -> RecipeListItem {
        RecipeListItem {
            id: self.id.clone(),
            name: self.name.clone(),
            template: self.template.clone(),
            main_spirit: self.main_spirit.clone(),
            glassware: self.glassware.clone(),
            serving_style: self.serving_style.clone(),
            has_image: self.has_image,
            user_id: self.user_id.clone(),
            visibility: self.visibility.clone(),
            my_rating: self.my_rating,
            created_at: self.created_at.clone(),
        }
    }
}
