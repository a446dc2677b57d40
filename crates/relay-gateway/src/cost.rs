use relay_core::{Model, Usage};

/// Cost of a completion from the model's pricing.
///
/// `prompt_tokens` includes cached tokens; when the model defines a cached
/// price, the difference between full and cached input price is refunded for
/// every cached token. Without a cached price, `cached_tokens` is
/// informational only.
pub fn compute_cost(model: &Model, usage: &Usage) -> f64 {
    let prompt = f64::from(usage.prompt_tokens);
    let completion = f64::from(usage.completion_tokens);
    let mut cost =
        prompt * model.price_per_input_token + completion * model.price_per_output_token;

    if let (Some(cached_price), Some(cached)) = (model.price_per_cached_token, usage.cached_tokens)
    {
        cost -= f64::from(cached) * (model.price_per_input_token - cached_price);
    }
    cost.max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::AdapterKind;

    fn model(price_in: f64, price_out: f64, price_cached: Option<f64>) -> Model {
        Model {
            model_id: "m".into(),
            provider: "p".into(),
            adapter: AdapterKind::Openai,
            provider_model_id: "m".into(),
            context_window: 8192,
            support_tool_calling: false,
            support_vision: false,
            price_per_input_token: price_in,
            price_per_output_token: price_out,
            price_per_cached_token: price_cached,
            extra_param: Default::default(),
            active: true,
        }
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() <= b.abs() * 1e-4
    }

    #[test]
    fn plain_cost_is_linear_in_tokens() {
        let m = model(2.5e-6, 1e-5, None);
        let usage = Usage::new(1000, 200, None);
        assert!(close(compute_cost(&m, &usage), 1000.0 * 2.5e-6 + 200.0 * 1e-5));
    }

    #[test]
    fn cached_tokens_are_discounted_only_with_a_cached_price() {
        let usage = Usage::new(1000, 0, Some(400));

        let no_discount = model(3e-6, 1.5e-5, None);
        assert!(close(compute_cost(&no_discount, &usage), 1000.0 * 3e-6));

        let discounted = model(3e-6, 1.5e-5, Some(3e-7));
        let expected = 1000.0 * 3e-6 - 400.0 * (3e-6 - 3e-7);
        assert!(close(compute_cost(&discounted, &usage), expected));
    }

    #[test]
    fn cost_never_goes_negative() {
        // Pathological pricing where the discount exceeds the total.
        let m = model(1e-6, 0.0, Some(0.0));
        let usage = Usage {
            prompt_tokens: 10,
            completion_tokens: 0,
            total_tokens: 10,
            cached_tokens: Some(100),
        };
        assert_eq!(compute_cost(&m, &usage), 0.0);
    }
}
