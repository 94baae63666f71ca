use serde::Deserialize;

#[derive(Deserialize, Debug)]
pub struct CardResponse {
    pub data: Option<CardData>,
}

#[derive(Deserialize, Debug)]
pub struct CardData {
    #[serde(default)]
    pub products: Vec<CardProduct>,
}

#[derive(Deserialize, Debug)]
pub struct CardProduct {
    pub name: Option<String>,
    /// Sale price in kopecks.
    #[serde(rename = "salePriceU")]
    pub sale_price_u: Option<i64>,
    pub rating: Option<f64>,
    #[serde(rename = "reviewRating")]
    pub review_rating: Option<f64>,
    #[serde(default)]
    pub sizes: Vec<CardSize>,
}

#[derive(Deserialize, Debug)]
pub struct CardSize {
    #[serde(default)]
    pub stocks: Vec<CardStock>,
}

#[derive(Deserialize, Debug)]
pub struct CardStock {
    pub qty: Option<i64>,
}
